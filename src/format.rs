use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, SecondsFormat};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::report::{basename, canonical_uuid, Addr, Backtrace, CrashReport, Frame};

lazy_static! {
    // Splits "iPhone OS 11.1.2 (15B202)" into the platform name and
    // everything from the first version digit onwards.
    static ref OS_VERSION_RE: Regex = Regex::new(r"^(.*)\s+(\d.*)$").unwrap();
}

const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f %z";

/// Header keys mapped into named payload fields. Everything else lands
/// verbatim in `metaData.report`.
const CONSUMED_KEYS: &[&str] = &[
    "Version",
    "Identifier",
    "CrashReporter Key",
    "Hardware Model",
    "Exception Type",
    "Termination Reason",
    "OS Version",
    "Date/Time",
];

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("required header field {0:?} is missing")]
    MissingField(&'static str),
    #[error("malformed OS Version header")]
    MalformedOsVersion,
    #[error("malformed Date/Time header")]
    InvalidTimestamp(#[source] chrono::ParseError),
}

/// Identity block reported alongside every event.
#[derive(Debug, Clone, Serialize)]
pub struct Notifier {
    pub name: String,
    pub url: String,
    pub version: String,
}

impl Default for Notifier {
    fn default() -> Notifier {
        Notifier {
            name: "Apple Crash Report Uploader".into(),
            url: "https://docs.rs/apple-crash-report-uploader".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

/// The wire payload: a notifier identity plus a single crash event.
#[derive(Debug, Serialize)]
pub struct Payload {
    pub notifier: Notifier,
    pub events: Vec<Event>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub exceptions: Vec<Exception>,
    pub unhandled: bool,
    pub severity: String,
    pub severity_reason: SeverityReason,
    pub threads: Vec<ThreadView>,
    pub app: App,
    pub device: Device,
    pub meta_data: MetaData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Exception {
    pub error_class: Option<String>,
    pub message: Option<String>,
    pub stacktrace: Vec<FrameView>,
}

#[derive(Debug, Serialize)]
pub struct SeverityReason {
    #[serde(rename = "type")]
    pub reason_type: String,
}

#[derive(Debug, Serialize)]
pub struct ThreadView {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub stacktrace: Vec<FrameView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameView {
    pub frame_address: Addr,
    /// Resolved image path, or the raw binary name when the frame's
    /// module matches no known image.
    pub macho_file: String,
    #[serde(rename = "machoUUID", skip_serializing_if = "Option::is_none")]
    pub macho_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macho_load_address: Option<Addr>,
    pub method: String,
    #[serde(rename = "isPC", skip_serializing_if = "std::ops::Not::not")]
    pub is_pc: bool,
    #[serde(rename = "isLR", skip_serializing_if = "std::ops::Not::not")]
    pub is_lr: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub in_foreground: bool,
    #[serde(rename = "dsymUUIDs")]
    pub dsym_uuids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub os_name: String,
    pub os_version: String,
    pub time: String,
}

#[derive(Debug, Serialize)]
pub struct MetaData {
    pub report: BTreeMap<String, String>,
}

/// Maps a parsed [`CrashReport`] into the wire [`Payload`].
#[derive(Debug, Default)]
pub struct Formatter {
    notifier: Notifier,
}

impl Formatter {
    pub fn new(notifier: Notifier) -> Formatter {
        Formatter { notifier }
    }

    /// Builds the payload for a report. Pure: the report is not touched.
    pub fn format(&self, report: &CrashReport) -> Result<Payload, FormatError> {
        let os_version = report
            .header_value("OS Version")
            .ok_or(FormatError::MissingField("OS Version"))?;
        let caps = OS_VERSION_RE
            .captures(os_version)
            .ok_or(FormatError::MalformedOsVersion)?;
        let (os_name, os_number) = (caps[1].to_string(), caps[2].to_string());

        let date_time = report
            .header_value("Date/Time")
            .ok_or(FormatError::MissingField("Date/Time"))?;
        let time = DateTime::<FixedOffset>::parse_from_str(date_time, DATE_TIME_FORMAT)
            .map_err(FormatError::InvalidTimestamp)?
            .to_rfc3339_opts(SecondsFormat::Millis, false);

        // First crashed backtrace becomes the exception stacktrace; any
        // further crashed ones are demoted to ordinary threads.
        let crashed = report.backtraces.iter().position(|b| b.crashed);

        let exceptions = vec![Exception {
            error_class: report.header_value("Exception Type").map(str::to_string),
            message: report
                .header_value("Termination Reason")
                .map(str::to_string),
            stacktrace: crashed
                .map(|i| stacktrace(report, &report.backtraces[i], true))
                .unwrap_or_default(),
        }];

        let threads = report
            .backtraces
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != crashed)
            .map(|(_, backtrace)| ThreadView {
                id: backtrace.index,
                name: backtrace.name.clone(),
                stacktrace: stacktrace(report, backtrace, false),
            })
            .collect();

        let app = App {
            id: report.header_value("Identifier").map(str::to_string),
            version: report.header_value("Version").map(str::to_string),
            in_foreground: report.header_value("Role") == Some("Foreground"),
            dsym_uuids: report
                .app_uuid
                .as_ref()
                .map(canonical_uuid)
                .into_iter()
                .collect(),
        };

        let device = Device {
            id: report.header_value("CrashReporter Key").map(str::to_string),
            model: report.header_value("Hardware Model").map(str::to_string),
            os_name,
            os_version: os_number,
            time,
        };

        let meta = report
            .header
            .iter()
            .filter(|(key, _)| !CONSUMED_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Payload {
            notifier: self.notifier.clone(),
            events: vec![Event {
                exceptions,
                unhandled: true,
                severity: "error".into(),
                severity_reason: SeverityReason {
                    reason_type: "unhandledException".into(),
                },
                threads,
                app,
                device,
                meta_data: MetaData { report: meta },
            }],
        })
    }
}

fn stacktrace(report: &CrashReport, backtrace: &Backtrace, mark_registers: bool) -> Vec<FrameView> {
    backtrace
        .frames
        .iter()
        .map(|frame| frame_view(report, frame, mark_registers))
        .collect()
}

fn frame_view(report: &CrashReport, frame: &Frame, mark_registers: bool) -> FrameView {
    let image = report.binary_images.get(basename(&frame.module));
    FrameView {
        frame_address: frame.addr,
        macho_file: image
            .map(|i| i.path.clone())
            .unwrap_or_else(|| frame.module.clone()),
        macho_uuid: image.map(|i| canonical_uuid(&i.uuid)),
        macho_load_address: image.map(|i| i.addr),
        method: frame.method.clone(),
        is_pc: mark_registers && report.program_counter == Some(frame.addr),
        is_lr: mark_registers && report.link_register == Some(frame.addr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::BinaryImage;
    use uuid::Uuid;

    fn base_report() -> CrashReport {
        let mut report = CrashReport::default();
        report.header = vec![
            ("Incident Identifier".into(), "5C32DF84".into()),
            ("CrashReporter Key".into(), "c0dec0de".into()),
            ("Hardware Model".into(), "iPhone9,3".into()),
            ("Version".into(), "1.2.3 (45)".into()),
            ("Identifier".into(), "com.example.MyApp".into()),
            ("Role".into(), "Foreground".into()),
            ("OS Version".into(), "iPhone OS 11.1.2 (15B202)".into()),
            ("Date/Time".into(), "2017-11-21 09:55:33.151 +0100".into()),
            ("Exception Type".into(), "EXC_BAD_ACCESS (SIGSEGV)".into()),
            (
                "Termination Reason".into(),
                "Namespace SIGNAL, Code 0xb".into(),
            ),
        ];
        report.add_image(BinaryImage {
            addr: Addr(0x100038000),
            name: "MyApp".into(),
            uuid: Uuid::parse_str("aabbccdd11223344aabbccdd11223344").unwrap(),
            path: "/var/containers/Bundle/Application/MyApp.app/MyApp".into(),
        });
        report.program_counter = Some(Addr(0x100043210));
        report.link_register = Some(Addr(0x1838f2fb8));
        report.backtraces = vec![
            Backtrace {
                index: 0,
                name: Some("main".into()),
                crashed: true,
                frames: vec![
                    Frame {
                        addr: Addr(0x100043210),
                        module: "MyApp".into(),
                        method: "0x100038000 + 45584".into(),
                    },
                    Frame {
                        addr: Addr(0x1838f2fb8),
                        module: "libdyld.dylib".into(),
                        method: "start + 4".into(),
                    },
                ],
            },
            Backtrace {
                index: 1,
                name: None,
                crashed: false,
                frames: vec![Frame {
                    addr: Addr(0x100043210),
                    module: "MyApp".into(),
                    method: "0x100038000 + 45584".into(),
                }],
            },
        ];
        report
    }

    fn format(report: &CrashReport) -> Payload {
        Formatter::new(Notifier::default()).format(report).unwrap()
    }

    #[test]
    fn test_consumed_keys_stay_out_of_metadata() {
        let payload = format(&base_report());
        let meta = &payload.events[0].meta_data.report;
        for key in CONSUMED_KEYS {
            assert!(!meta.contains_key(*key), "{} leaked into metadata", key);
        }
        assert_eq!(meta.get("Incident Identifier").map(String::as_str), Some("5C32DF84"));
        // Role is read but not consumed.
        assert_eq!(meta.get("Role").map(String::as_str), Some("Foreground"));
    }

    #[test]
    fn test_named_field_mapping() {
        let payload = format(&base_report());
        let event = &payload.events[0];
        assert_eq!(event.app.version.as_deref(), Some("1.2.3 (45)"));
        assert_eq!(event.app.id.as_deref(), Some("com.example.MyApp"));
        assert!(event.app.in_foreground);
        assert_eq!(event.device.id.as_deref(), Some("c0dec0de"));
        assert_eq!(event.device.model.as_deref(), Some("iPhone9,3"));
        assert_eq!(event.device.os_name, "iPhone OS");
        assert_eq!(event.device.os_version, "11.1.2 (15B202)");
        assert_eq!(event.device.time, "2017-11-21T09:55:33.151+01:00");
        assert_eq!(
            event.exceptions[0].error_class.as_deref(),
            Some("EXC_BAD_ACCESS (SIGSEGV)")
        );
        assert_eq!(
            event.exceptions[0].message.as_deref(),
            Some("Namespace SIGNAL, Code 0xb")
        );
        assert!(event.unhandled);
        assert_eq!(event.severity, "error");
        assert_eq!(event.severity_reason.reason_type, "unhandledException");
    }

    #[test]
    fn test_dsym_uuids_are_canonical() {
        let payload = format(&base_report());
        assert_eq!(
            payload.events[0].app.dsym_uuids,
            vec!["AABBCCDD-1122-3344-AABB-CCDD11223344".to_string()]
        );
    }

    #[test]
    fn test_dsym_uuids_empty_without_images() {
        let mut report = base_report();
        report.app_uuid = None;
        let payload = format(&report);
        assert!(payload.events[0].app.dsym_uuids.is_empty());
    }

    #[test]
    fn test_crashed_backtrace_becomes_the_exception() {
        let payload = format(&base_report());
        let event = &payload.events[0];
        assert_eq!(event.exceptions[0].stacktrace.len(), 2);
        assert_eq!(event.threads.len(), 1);
        assert_eq!(event.threads[0].id, 1);
    }

    #[test]
    fn test_frame_resolution() {
        let payload = format(&base_report());
        let stacktrace = &payload.events[0].exceptions[0].stacktrace;

        let resolved = &stacktrace[0];
        assert_eq!(
            resolved.macho_file,
            "/var/containers/Bundle/Application/MyApp.app/MyApp"
        );
        assert_eq!(
            resolved.macho_uuid.as_deref(),
            Some("AABBCCDD-1122-3344-AABB-CCDD11223344")
        );
        assert_eq!(resolved.macho_load_address, Some(Addr(0x100038000)));

        let unresolved = &stacktrace[1];
        assert_eq!(unresolved.macho_file, "libdyld.dylib");
        assert_eq!(unresolved.macho_uuid, None);
        assert_eq!(unresolved.macho_load_address, None);
    }

    #[test]
    fn test_pc_lr_only_marked_on_exception_stacktrace() {
        let payload = format(&base_report());
        let event = &payload.events[0];
        assert!(event.exceptions[0].stacktrace[0].is_pc);
        assert!(!event.exceptions[0].stacktrace[0].is_lr);
        assert!(event.exceptions[0].stacktrace[1].is_lr);
        // Same address appears in the other thread but stays unmarked.
        assert!(!event.threads[0].stacktrace[0].is_pc);
        assert!(!event.threads[0].stacktrace[0].is_lr);
    }

    #[test]
    fn test_no_crashed_backtrace() {
        let mut report = base_report();
        for backtrace in &mut report.backtraces {
            backtrace.crashed = false;
        }
        let payload = format(&report);
        let event = &payload.events[0];
        assert!(event.exceptions[0].stacktrace.is_empty());
        assert_eq!(event.threads.len(), 2);
    }

    #[test]
    fn test_second_crashed_backtrace_is_demoted() {
        let mut report = base_report();
        report.backtraces[1].crashed = true;
        let payload = format(&report);
        let event = &payload.events[0];
        // First one wins; the second is an ordinary thread entry.
        assert_eq!(event.exceptions[0].stacktrace.len(), 2);
        assert_eq!(event.threads.len(), 1);
        assert_eq!(event.threads[0].id, 1);
    }

    #[test]
    fn test_missing_required_fields() {
        let mut report = base_report();
        report.header.retain(|(key, _)| key != "OS Version");
        let result = Formatter::default().format(&report);
        assert!(matches!(
            result,
            Err(FormatError::MissingField("OS Version"))
        ));

        let mut report = base_report();
        report.header.retain(|(key, _)| key != "Date/Time");
        let result = Formatter::default().format(&report);
        assert!(matches!(result, Err(FormatError::MissingField("Date/Time"))));
    }

    #[test]
    fn test_malformed_required_fields() {
        let mut report = base_report();
        for (key, value) in &mut report.header {
            if key == "OS Version" {
                *value = "versionless".into();
            }
        }
        let result = Formatter::default().format(&report);
        assert!(matches!(result, Err(FormatError::MalformedOsVersion)));

        let mut report = base_report();
        for (key, value) in &mut report.header {
            if key == "Date/Time" {
                *value = "yesterday around noon".into();
            }
        }
        let result = Formatter::default().format(&report);
        assert!(matches!(result, Err(FormatError::InvalidTimestamp(_))));
    }

    #[test]
    fn test_wire_field_names() {
        let payload = format(&base_report());
        let value = serde_json::to_value(&payload).unwrap();
        let event = &value["events"][0];
        assert!(event["app"].get("dsymUUIDs").is_some());
        assert!(event["app"].get("inForeground").is_some());
        assert!(event["device"].get("osName").is_some());
        assert!(event["device"].get("osVersion").is_some());
        assert!(event["metaData"]["report"].is_object());
        assert_eq!(event["severityReason"]["type"], "unhandledException");

        let frame = &event["exceptions"][0]["stacktrace"][0];
        assert_eq!(frame["frameAddress"], "0x100043210");
        assert!(frame.get("machoUUID").is_some());
        assert!(frame.get("machoLoadAddress").is_some());
        assert_eq!(frame["isPC"], true);
        // False flags are omitted entirely.
        assert!(frame.get("isLR").is_none());
        let thread_frame = &event["threads"][0]["stacktrace"][0];
        assert!(thread_frame.get("isPC").is_none());
    }
}
