use crate::TimedReport;
use bytes::BufMut;
use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;

const SEPARATOR: char = '\n';

/// Receives the segments that [`decode`] could not parse.
pub trait Diagnostic {
    fn dropped(&mut self, segment: &str, error: &serde_json::Error);
}

/// Reports dropped segments through the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct Log;

impl Diagnostic for Log {
    fn dropped(&mut self, segment: &str, error: &serde_json::Error) {
        log::warn!("Could not parse report {segment:?}: {error}");
    }
}

impl<F: FnMut(&str, &serde_json::Error)> Diagnostic for F {
    fn dropped(&mut self, segment: &str, error: &serde_json::Error) {
        self(segment, error)
    }
}

/// Serializes a report to one newline terminated frame.
///
/// JSON string escaping turns any newline inside the payload into `\n`, so the
/// terminator is the only raw newline in the frame. Non-finite timings have no
/// JSON form and are written as zero.
pub fn encode(report: &TimedReport) -> String {
    if !report.timing.is_finite() || !report.delta.is_finite() {
        log::warn!("Zeroing non-finite timing {} / delta {} of {} report", report.timing, report.delta, report.report.kind());
        let finite = TimedReport {
            report: report.report.clone(),
            timing: finite(report.timing),
            delta: finite(report.delta),
        };
        return encode(&finite);
    }
    let mut frame = match serde_json::to_string(report) {
        Ok(frame) => frame,
        // maps keyed by strings and finite floats always serialize
        Err(error) => {
            log::error!("Could not serialize report: {error}");
            String::new()
        }
    };
    frame.push(SEPARATOR);
    frame
}

fn finite(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Parses every complete frame found in `buffer`.
///
/// Segments that fail to parse are handed to `sink` and left out of the
/// result, this never fails.
pub fn decode(buffer: &str, sink: &mut impl Diagnostic) -> Vec<TimedReport> {
    buffer
        .split(SEPARATOR)
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .filter_map(|segment| match serde_json::from_str(segment) {
            Ok(report) => Some(report),
            Err(error) => {
                sink.dropped(segment, &error);
                None
            }
        })
        .collect()
}

/// Carry-over buffer for text arriving in arbitrary pieces.
///
/// Only the prefix up to the last separator is decoded, a trailing partial
/// frame waits for the next [`Buffer::push`].
#[derive(Default, Debug)]
pub struct Buffer {
    text: String,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: &str, sink: &mut impl Diagnostic) -> Vec<TimedReport> {
        self.text.push_str(text);
        match self.text.rfind(SEPARATOR) {
            Some(index) => {
                let rest = self.text.split_off(index + 1);
                let complete = std::mem::replace(&mut self.text, rest);
                decode(&complete, sink)
            }
            None => Vec::new(),
        }
    }

    /// Decodes whatever is left once the wire closed.
    pub fn finish(&mut self, sink: &mut impl Diagnostic) -> Vec<TimedReport> {
        let rest = std::mem::take(&mut self.text);
        decode(&rest, sink)
    }

    pub fn pending(&self) -> &str {
        &self.text
    }
}

/// Frame codec for byte streams, splitting on the newline byte.
#[derive(Default, Debug)]
pub struct FrameCodec<D = Log> {
    sink: D,
    // bytes already searched for a separator
    searched: usize,
}

impl FrameCodec<Log> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<D: Diagnostic> FrameCodec<D> {
    pub fn with_diagnostic(sink: D) -> Self {
        Self { sink, searched: 0 }
    }

    fn parse(&mut self, line: &[u8]) -> Option<TimedReport> {
        let text = String::from_utf8_lossy(line);
        decode(&text, &mut self.sink).pop()
    }
}

impl<D: Diagnostic> Decoder for FrameCodec<D> {
    type Item = TimedReport;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<TimedReport>, std::io::Error> {
        loop {
            let position = src[self.searched..].iter().position(|byte| *byte == SEPARATOR as u8);
            let Some(position) = position else {
                self.searched = src.len();
                return Ok(None);
            };
            let line = src.split_to(self.searched + position + 1);
            self.searched = 0;
            if let Some(report) = self.parse(&line) {
                return Ok(Some(report));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<TimedReport>, std::io::Error> {
        if let Some(report) = self.decode(src)? {
            return Ok(Some(report));
        }
        self.searched = 0;
        if src.is_empty() {
            return Ok(None);
        }
        let line = src.split();
        Ok(self.parse(&line))
    }
}

impl<D> Encoder<TimedReport> for FrameCodec<D> {
    type Error = std::io::Error;

    fn encode(&mut self, item: TimedReport, dst: &mut BytesMut) -> Result<(), std::io::Error> {
        let frame = encode(&item);
        dst.reserve(frame.len());
        dst.put_slice(frame.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
fn samples() -> Vec<TimedReport> {
    use crate::Report;
    use std::collections::BTreeMap;
    vec![
        TimedReport {
            report: Report::start(200, "OK", BTreeMap::from([(String::from("content-type"), String::from("text/plain"))])),
            timing: 104.87512,
            delta: 104.87512,
        },
        TimedReport {
            report: Report::chunk("line one\nline two\r\n{\"json\": true}"),
            timing: 130.1,
            delta: 25.22488,
        },
        TimedReport {
            report: Report::chunk("ünïcödé ✓"),
            timing: 131.0,
            delta: 0.9,
        },
        TimedReport {
            report: Report::End,
            timing: 131.0,
            delta: 0.0,
        },
    ]
}

#[test]
fn test_encode_single_line() {
    for report in samples() {
        let frame = encode(&report);
        assert!(frame.ends_with('\n'));
        assert_eq!(1, frame.matches('\n').count(), "{frame:?}");
        assert!(!frame.contains('\r'));
    }
}

#[test]
fn test_decode_encode() {
    for report in samples() {
        assert_eq!(vec![report.clone()], decode(&encode(&report), &mut Log));
    }
}

#[test]
fn test_encode_non_finite_timing() {
    let report = TimedReport {
        report: crate::Report::End,
        timing: f64::NAN,
        delta: f64::INFINITY,
    };
    let frame = encode(&report);
    assert_eq!("{\"type\":\"end\",\"timing\":0.0,\"delta\":0.0}\n", frame);
    let decoded = decode(&frame, &mut Log);
    assert_eq!(1, decoded.len());
    assert_eq!((0.0, 0.0), (decoded[0].timing, decoded[0].delta));
}

#[test]
fn test_decode_concatenated() {
    let reports = samples();
    let wire = reports.iter().map(encode).collect::<String>();
    assert_eq!(reports, decode(&wire, &mut Log));
}

#[test]
fn test_decode_skips_blank_and_padded_segments() {
    let reports = samples();
    let wire = format!("\n  {}  \n\n\t{}\n\n", encode(&reports[0]).trim(), encode(&reports[3]).trim());
    assert_eq!(vec![reports[0].clone(), reports[3].clone()], decode(&wire, &mut Log));
    assert!(decode("", &mut Log).is_empty());
    assert!(decode("\n\n \n", &mut Log).is_empty());
}

#[test]
fn test_decode_drops_malformed() {
    let reports = samples();
    let wire = format!("{}{{\"type\":\"chunk\",\"tim\n{}not json\n", encode(&reports[0]), encode(&reports[3]));
    let mut dropped = Vec::new();
    let decoded = decode(&wire, &mut |segment: &str, _: &serde_json::Error| dropped.push(segment.to_owned()));
    assert_eq!(vec![reports[0].clone(), reports[3].clone()], decoded);
    assert_eq!(vec![String::from("{\"type\":\"chunk\",\"tim"), String::from("not json")], dropped);
}

#[test]
fn test_buffer_arbitrary_splits() {
    let reports = samples();
    let wire = reports.iter().map(encode).collect::<String>();
    let characters = wire.chars().collect::<Vec<char>>();
    for size in [1, 2, 3, 7, 16, 64, characters.len()] {
        let mut buffer = Buffer::new();
        let mut dropped = 0;
        let mut decoded = Vec::new();
        for piece in characters.chunks(size) {
            let piece = piece.iter().collect::<String>();
            decoded.extend(buffer.push(&piece, &mut |_: &str, _: &serde_json::Error| dropped += 1));
        }
        decoded.extend(buffer.finish(&mut |_: &str, _: &serde_json::Error| dropped += 1));
        assert_eq!(reports, decoded, "size {size}");
        assert_eq!(0, dropped, "size {size}");
    }
}

#[test]
fn test_buffer_keeps_partial_tail() {
    let reports = samples();
    let frame = encode(&reports[3]);
    let (head, tail) = frame.split_at(10);
    let mut buffer = Buffer::new();
    assert!(buffer.push(head, &mut Log).is_empty());
    assert_eq!(head, buffer.pending());
    assert_eq!(vec![reports[3].clone()], buffer.push(tail, &mut Log));
    assert_eq!("", buffer.pending());
}

#[test]
fn test_buffer_finish_unterminated() {
    let reports = samples();
    let frame = encode(&reports[3]);
    let mut buffer = Buffer::new();
    assert!(buffer.push(frame.trim_end(), &mut Log).is_empty());
    assert_eq!(vec![reports[3].clone()], buffer.finish(&mut Log));
    assert!(buffer.finish(&mut Log).is_empty());
}

#[test]
fn test_frame_codec_split_bytes() {
    let reports = samples();
    let wire = reports.iter().map(encode).collect::<String>().into_bytes();
    for size in [1, 5, 33, wire.len()] {
        let mut codec = FrameCodec::new();
        let mut src = BytesMut::new();
        let mut decoded = Vec::new();
        for piece in wire.chunks(size) {
            src.extend_from_slice(piece);
            while let Some(report) = Decoder::decode(&mut codec, &mut src).unwrap() {
                decoded.push(report);
            }
        }
        while let Some(report) = codec.decode_eof(&mut src).unwrap() {
            decoded.push(report);
        }
        assert_eq!(reports, decoded, "size {size}");
    }
}

#[test]
fn test_frame_codec_drops_malformed() {
    let reports = samples();
    let mut count = 0;
    let mut codec = FrameCodec::with_diagnostic(|_: &str, _: &serde_json::Error| count += 1);
    let mut src = BytesMut::from(format!("garbage\n{}", encode(&reports[0])).as_str());
    assert_eq!(Some(reports[0].clone()), Decoder::decode(&mut codec, &mut src).unwrap());
    assert_eq!(None, Decoder::decode(&mut codec, &mut src).unwrap());
    drop(codec);
    assert_eq!(1, count);
}

#[test]
fn test_frame_codec_encode() {
    let reports = samples();
    let mut codec = FrameCodec::new();
    let mut dst = BytesMut::new();
    for report in reports.iter() {
        codec.encode(report.clone(), &mut dst).unwrap();
    }
    let expected = reports.iter().map(encode).collect::<String>();
    assert_eq!(expected.as_bytes(), &dst[..]);
}
