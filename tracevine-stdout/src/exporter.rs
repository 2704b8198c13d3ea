use chrono::{DateTime, Utc};
use core::fmt;
use futures_util::future::BoxFuture;
use std::sync::atomic;

use tracevine::export::{ExportResult, SpanRecord, WireValue};
use tracevine::TraceError;

/// A tracevine exporter that writes span records to stdout on export.
pub struct SpanExporter {
    is_shutdown: atomic::AtomicBool,
}

impl fmt::Debug for SpanExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SpanExporter")
    }
}

impl Default for SpanExporter {
    fn default() -> Self {
        SpanExporter {
            is_shutdown: atomic::AtomicBool::new(false),
        }
    }
}

impl tracevine::export::SpanExporter for SpanExporter {
    /// Write span records to stdout
    fn export(&mut self, batch: Vec<SpanRecord>) -> BoxFuture<'static, ExportResult> {
        if self.is_shutdown.load(atomic::Ordering::SeqCst) {
            Box::pin(futures_util::future::ready(Err(TraceError::from(
                "exporter is shut down",
            ))))
        } else {
            print_records(batch);
            Box::pin(futures_util::future::ready(Ok(())))
        }
    }

    fn shutdown(&mut self) {
        self.is_shutdown.store(true, atomic::Ordering::SeqCst);
    }
}

fn print_records(batch: Vec<SpanRecord>) {
    let mut i = 0;
    for record in batch {
        println!("Span #{}", i);
        i = i + 1;
        if let Some(name) = string_of(&record, "name") {
            println!("\t Name: {:?}", name);
        }
        println!("\t TraceId: {:?}", record.trace_id);
        if let Some(guid) = string_of(&record, "guid") {
            println!("\t Guid: {:?}", guid);
        }
        if let Some(parent) = string_of(&record, "parentId") {
            println!("\t ParentId: {:?}", parent);
        }
        if let Some(transaction) = string_of(&record, "transactionId") {
            println!("\t TransactionId: {:?}", transaction);
        }
        if let Some(category) = string_of(&record, "category") {
            println!("\t Category: {:?}", category);
        }
        if let Some(component) = string_of(&record, "component") {
            println!("\t Component: {:?}", component);
        }
        if let Some(kind) = string_of(&record, "span.kind") {
            println!("\t Kind: {:?}", kind);
        }
        if let Some(WireValue::Bool(sampled)) = record.intrinsics.get("sampled") {
            println!("\t Sampled: {}", sampled);
        }
        if let Some(WireValue::Double(priority)) = record.intrinsics.get("priority") {
            println!("\t Priority: {}", priority);
        }
        if let Some(WireValue::Int(timestamp)) = record.intrinsics.get("timestamp") {
            let datetime: Option<DateTime<Utc>> = DateTime::from_timestamp_millis(*timestamp);
            if let Some(datetime) = datetime {
                println!(
                    "\t Start time: {}",
                    datetime.format("%Y-%m-%d %H:%M:%S%.6f")
                );
            }
        }
        if let Some(WireValue::Double(duration)) = record.intrinsics.get("duration") {
            println!("\t Duration: {}s", duration);
        }

        let mut print_header = true;
        for (key, value) in record.agent_attributes.iter() {
            if print_header {
                println!("\t Agent attributes:");
                print_header = false;
            }
            println!("\t\t {}: {:?}", key, value);
        }

        print_header = true;
        for (key, value) in record.user_attributes.iter() {
            if print_header {
                println!("\t User attributes:");
                print_header = false;
            }
            println!("\t\t {}: {:?}", key, value);
        }
    }
}

fn string_of<'a>(record: &'a SpanRecord, key: &str) -> Option<&'a str> {
    match record.intrinsics.get(key) {
        Some(WireValue::String(value)) => Some(value.as_str()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use tracevine::export::SpanExporter as _;

    #[test]
    fn export_after_shutdown_fails() {
        let mut exporter = SpanExporter::default();
        exporter.shutdown();

        let result = exporter.export(Vec::new()).now_or_never().unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn export_succeeds_while_running() {
        let mut exporter = SpanExporter::default();
        let result = exporter.export(Vec::new()).now_or_never().unwrap();
        assert!(result.is_ok());
    }
}
