use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use serde::Serialize;
use std::io::Write;

/// Streams records into a JSON list, one element per completed experiment.
///
/// `serde_json` has no incremental list serializer, so we write the brackets
/// and separators by hand and flush after every record; a crashed run keeps
/// everything written so far.
pub struct ResultWriter<W: Write> {
    sink: W,
    first: bool,
}

impl<W: Write> ResultWriter<W> {
    pub fn new(mut sink: W) -> Result<Self, Report> {
        sink.write_all(b"[\n").wrap_err("result writer header")?;
        Ok(Self { sink, first: true })
    }

    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<(), Report> {
        if !self.first {
            self.sink.write_all(b",\n").wrap_err("result separator")?;
        }
        self.first = false;
        serde_json::to_writer(&mut self.sink, record).wrap_err("serialize result")?;
        self.sink.flush().wrap_err("flush result")?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<(), Report> {
        self.sink.write_all(b"\n]\n").wrap_err("result writer footer")?;
        self.sink.flush().wrap_err("flush results")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_writer_streams_a_json_list() {
        let mut buffer = Vec::new();
        let mut writer = ResultWriter::new(&mut buffer).unwrap();
        writer.write(&json!({"a": 1})).unwrap();
        writer.write(&json!({"b": 2})).unwrap();
        writer.finish().unwrap();

        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(text, "[\n{\"a\":1},\n{\"b\":2}\n]\n");

        // and the whole thing is valid json
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn result_writer_partial_output_is_recoverable() {
        let mut buffer = Vec::new();
        let mut writer = ResultWriter::new(&mut buffer).unwrap();
        writer.write(&json!({"a": 1})).unwrap();
        // no finish(): the run crashed, but the record is already on disk
        drop(writer);
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("{\"a\":1}"));
    }

    #[test]
    fn result_writer_empty_list() {
        let mut buffer = Vec::new();
        let writer = ResultWriter::new(&mut buffer).unwrap();
        writer.finish().unwrap();
        let parsed: Vec<serde_json::Value> =
            serde_json::from_slice(&buffer).unwrap();
        assert!(parsed.is_empty());
    }
}
