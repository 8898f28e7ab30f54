//! Reading input records and writing output records.
//!
//! Input is either JSONL or CSV, from a file or from standard input. We decide
//! which by looking at the file extension, or, for standard input, at the
//! first byte. Output is always JSONL.

use std::{pin::Pin, sync::Arc, task::Context};

use futures::{TryStreamExt as _, pin_mut, stream::StreamExt as _};
use serde_json::Map;
use tokio::{
    fs::File,
    io::{
        AsyncBufRead, AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _,
        BufReader, BufWriter, ReadBuf,
    },
};
use tokio_stream::wrappers::LinesStream;

use crate::{
    prelude::*,
    ui::{ProgressConfig, Ui},
};

use super::{BoxedStream, size_hint::WithSizeHintExt};

/// A buffered reader that knows whether its input is JSONL or CSV.
pub struct RecordReader {
    /// Is this JSONL? If not, we treat it as CSV.
    is_jsonl: bool,

    /// Where we're reading from, for error messages.
    description: String,

    reader: Pin<Box<dyn AsyncBufRead + Unpin + Send + Sync + 'static>>,
}

impl RecordReader {
    /// Wrap `reader`, sniffing the format from the first byte.
    pub async fn from_reader(
        description: String,
        reader: impl AsyncRead + Unpin + Send + Sync + 'static,
    ) -> Result<Self> {
        let mut reader = BufReader::new(reader);
        // `fill_buf` lets us look at the first byte without consuming it.
        let first = reader
            .fill_buf()
            .await
            .with_context(|| format!("cannot read from {}", description))?
            .first()
            .copied();
        Ok(Self {
            is_jsonl: first == Some(b'{'),
            description,
            reader: Box::pin(reader),
        })
    }

    /// Open `path`, using its extension to pick a format.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let ext = path.extension().unwrap_or_default();
        let file = File::open(path)
            .await
            .with_context(|| format!("cannot open {:?}", path))?;
        Ok(Self {
            is_jsonl: ext == "jsonl" || ext == "json",
            description: path.to_string_lossy().into_owned(),
            reader: Box::pin(BufReader::new(file)),
        })
    }

    /// Open `path`, or standard input if `path` is `None`.
    pub async fn from_path_or_stdin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_path(path).await,
            None => Self::from_reader("stdin".to_owned(), tokio::io::stdin()).await,
        }
    }

    /// Is our input JSONL?
    pub fn is_jsonl(&self) -> bool {
        self.is_jsonl
    }
}

impl AsyncRead for RecordReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        Pin::get_mut(self).reader.as_mut().poll_read(cx, buf)
    }
}

impl AsyncBufRead for RecordReader {
    fn poll_fill_buf(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> std::task::Poll<std::io::Result<&[u8]>> {
        Pin::get_mut(self).reader.as_mut().poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::get_mut(self).reader.as_mut().consume(amt)
    }
}

/// Count the records in a JSONL or CSV file, so we can show a real progress
/// bar. Returns a stream size hint.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn count_records(ui: &Ui, path: &Path) -> Result<(usize, Option<usize>)> {
    // Pipes and other special files can only be read once.
    if !path.is_file() {
        return Ok((0, None));
    }

    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "🧮",
        msg: "Counting documents",
        done_msg: "Counted documents",
    });
    let reader = RecordReader::from_path(path).await?;
    let count = if reader.is_jsonl() {
        LinesStream::new(reader.lines())
            .try_fold(0, |count, line| async move {
                Ok(count + usize::from(!line.trim().is_empty()))
            })
            .await?
    } else {
        csv_async::AsyncReaderBuilder::new()
            .create_reader(reader)
            .into_byte_records()
            .try_fold(0, |count, _record| async move { Ok(count + 1) })
            .await?
    };
    spinner.finish_with_message(format!("Found {count} documents"));
    Ok((count, Some(count)))
}

/// A stream of JSON values.
pub type JsonStream = BoxedStream<Result<Value>>;

/// Read JSONL or CSV records from a file or stdin, as JSON objects. CSV
/// fields all become strings.
pub async fn read_jsonl_or_csv(ui: &Ui, path: Option<&Path>) -> Result<JsonStream> {
    let size_hint = match path {
        Some(path) => count_records(ui, path).await?,
        None => (0, None),
    };

    let reader = RecordReader::from_path_or_stdin(path).await?;
    let description = Arc::new(reader.description.clone());
    if reader.is_jsonl() {
        let lines = LinesStream::new(reader.lines())
            .try_filter(|line| futures::future::ready(!line.trim().is_empty()))
            .with_size_hint(size_hint);
        Ok(lines
            .map(move |line| {
                let line = line.with_context(|| format!("cannot read from {}", description))?;
                serde_json::from_str::<Value>(&line).with_context(|| {
                    format!("cannot parse JSON line in {}: {:?}", description, line)
                })
            })
            .boxed())
    } else {
        let mut reader = csv_async::AsyncReaderBuilder::new().create_reader(reader);
        let headers = Arc::new(
            reader
                .headers()
                .await
                .with_context(|| format!("cannot read CSV headers from {}", description))?
                .to_owned(),
        );
        Ok(reader
            .into_records()
            .with_size_hint(size_hint)
            .map(move |record| {
                let record = record
                    .with_context(|| format!("cannot read CSV record from {}", description))?;
                let object = headers
                    .iter()
                    .zip(record.iter())
                    .map(|(header, value)| (header.to_owned(), Value::String(value.to_owned())))
                    .collect::<Map<String, Value>>();
                Ok(Value::Object(object))
            })
            .boxed())
    }
}

/// Create a writer for `path`, or for standard output.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("cannot create {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write each value in `stream` as one line of JSON.
pub async fn write_output(path: Option<&Path>, stream: JsonStream) -> Result<()> {
    let mut writer = BufWriter::new(create_writer(path).await?);
    pin_mut!(stream);
    while let Some(value) = stream.next().await {
        let value = value?;
        let json = serde_json::to_string(&value).context("cannot serialize output record")?;
        writer
            .write_all(json.as_bytes())
            .await
            .context("cannot write output")?;
        writer.write_all(b"\n").await.context("cannot write output")?;
    }
    writer.flush().await.context("cannot flush output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt as _;

    use super::*;

    async fn read_all(path: &Path) -> Vec<Value> {
        let ui = Ui::init_for_tests();
        read_jsonl_or_csv(&ui, Some(path))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reads_jsonl_and_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.jsonl");
        tokio::fs::write(
            &path,
            "{\"id\": 1, \"path\": \"a.pdf\"}\n\n{\"id\": 2, \"path\": \"b.png\"}\n",
        )
        .await
        .unwrap();

        let ui = Ui::init_for_tests();
        assert_eq!(count_records(&ui, &path).await.unwrap(), (2, Some(2)));
        let values = read_all(&path).await;
        assert_eq!(values.len(), 2);
        assert_eq!(values[1]["path"], "b.png");
    }

    #[tokio::test]
    async fn reads_csv_as_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.csv");
        tokio::fs::write(&path, "id,path,mime_type\n7,scan.pdf,\n8,photo.jpg,image/jpeg\n")
            .await
            .unwrap();

        let values = read_all(&path).await;
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["id"], "7");
        assert_eq!(values[0]["mime_type"], "");
        assert_eq!(values[1]["mime_type"], "image/jpeg");
    }

    #[tokio::test]
    async fn sniffs_jsonl_from_first_byte() {
        let reader = RecordReader::from_reader("test".to_owned(), &b"{\"id\": 1}\n"[..])
            .await
            .unwrap();
        assert!(reader.is_jsonl());
        let reader = RecordReader::from_reader("test".to_owned(), &b"id,path\n"[..])
            .await
            .unwrap();
        assert!(!reader.is_jsonl());
    }

    #[tokio::test]
    async fn writes_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.jsonl");
        let stream = futures::stream::iter(vec![
            Ok(serde_json::json!({ "id": 1 })),
            Ok(serde_json::json!({ "id": 2 })),
        ])
        .boxed();
        write_output(Some(&path), stream).await.unwrap();
        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(written, "{\"id\":1}\n{\"id\":2}\n");
    }
}
