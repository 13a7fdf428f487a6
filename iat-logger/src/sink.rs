use std::{fs::File, io::Write, path::Path};

use anyhow::{Context, Result};
use iat_logger_common::PacketEvent;
use serde::Serialize;

pub const DEFAULT_OUTPUT: &str = "packet_data.csv";
const HEADER: [&str; 4] = ["Timestamp (ns)", "IAT (ns)", "Packet Length", "Direction"];

// Field order must match HEADER.
#[derive(Serialize)]
struct CsvRow {
    timestamp_ns: u64,
    iat_ns: u64,
    packet_length: u64,
    direction: &'static str,
}

/// Appends every received event to a CSV table.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
    written: u64,
    skipped: u64,
}

impl CsvSink<File> {
    pub fn create(path: &Path) -> Result<Self> {
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        Self::new(file)
    }
}

impl<W: Write> CsvSink<W> {
    /// Wraps `out` and writes the header row straight away, so even a run
    /// that sees no packets leaves a well-formed table behind.
    pub fn new(out: W) -> Result<Self> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(out);
        writer
            .write_record(HEADER)
            .context("failed to write csv header")?;
        Ok(Self {
            writer,
            written: 0,
            skipped: 0,
        })
    }

    pub fn record(&mut self, event: &PacketEvent) -> Result<()> {
        let Some(direction) = event.direction() else {
            self.skipped += 1;
            tracing::warn!(direction = event.direction, "skipping event with unknown direction");
            return Ok(());
        };

        tracing::debug!(
            direction = direction.label(),
            length = event.packet_length,
            iat_ns = event.iat_ns,
            "packet"
        );

        self.writer
            .serialize(CsvRow {
                timestamp_ns: event.timestamp_ns,
                iat_ns: event.iat_ns,
                packet_length: event.packet_length,
                direction: direction.label(),
            })
            .context("failed to write csv row")?;
        self.written += 1;
        Ok(())
    }

    pub fn record_all<I>(&mut self, events: I) -> Result<usize>
    where
        I: IntoIterator<Item = PacketEvent>,
    {
        let mut count = 0;
        for event in events {
            self.record(&event)?;
            count += 1;
        }
        Ok(count)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("failed to flush csv output")
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        match self.writer.into_inner() {
            Ok(out) => out,
            Err(err) => panic!("csv writer flush failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use iat_logger_common::Direction;

    use super::*;

    fn render(events: &[PacketEvent]) -> (String, u64, u64) {
        let mut sink = CsvSink::new(Vec::new()).expect("sink");
        sink.record_all(events.iter().copied()).expect("record");
        let (written, skipped) = (sink.written(), sink.skipped());
        let out = String::from_utf8(sink.into_inner()).expect("utf8");
        (out, written, skipped)
    }

    #[test]
    fn writes_header_and_labelled_rows() {
        let (out, written, _) = render(&[
            PacketEvent::new(100, 0, 64, Direction::Ingress),
            PacketEvent::new(120, 0, 1500, Direction::Egress),
        ]);
        assert_eq!(written, 2);
        assert_eq!(
            out,
            "Timestamp (ns),IAT (ns),Packet Length,Direction\n\
             100,0,64,Incoming\n\
             120,0,1500,Outgoing\n"
        );
    }

    #[test]
    fn skips_unknown_direction() {
        let mut bogus = PacketEvent::new(5, 0, 10, Direction::Ingress);
        bogus.direction = 7;
        let (out, written, skipped) = render(&[bogus, PacketEvent::new(6, 1, 20, Direction::Egress)]);
        assert_eq!((written, skipped), (1, 1));
        assert!(out.ends_with("6,1,20,Outgoing\n"));
    }

    #[test]
    fn empty_run_still_has_header() {
        let (out, written, _) = render(&[]);
        assert_eq!(written, 0);
        assert_eq!(out, "Timestamp (ns),IAT (ns),Packet Length,Direction\n");
    }
}
