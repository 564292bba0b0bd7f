use crate::config::Compression;
use crate::database::DumpStream;
use crate::error::DumpError;
use flate2::write::GzEncoder;
use futures::StreamExt;
use std::io::Write;

const GZIP_LEVEL: u32 = 6;

/// Applies the configured compression to a dump stream.
pub fn compress(stream: DumpStream, compression: Compression) -> DumpStream {
    match compression {
        Compression::Gzip => gzip(stream),
        Compression::None => stream,
    }
}

/// Gzips a dump stream chunk by chunk, without buffering the whole dump.
///
/// Upstream errors are passed through unchanged and end the stream, so a
/// failed dump never yields a valid gzip trailer.
pub fn gzip(stream: DumpStream) -> DumpStream {
    let encoder = GzEncoder::new(Vec::new(), flate2::Compression::new(GZIP_LEVEL));

    futures::stream::unfold(Some((stream, encoder)), |state| async move {
        let (mut stream, mut encoder) = state?;
        loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    if let Err(e) = encoder.write_all(&chunk) {
                        return Some((Err(DumpError::Stream(e)), None));
                    }
                    let compressed = std::mem::take(encoder.get_mut());
                    if !compressed.is_empty() {
                        return Some((Ok(compressed), Some((stream, encoder))));
                    }
                }
                Some(Err(e)) => return Some((Err(e), None)),
                None => {
                    return match encoder.finish() {
                        Ok(rest) => Some((Ok(rest), None)),
                        Err(e) => Some((Err(DumpError::Stream(e)), None)),
                    };
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn source(items: Vec<Result<Vec<u8>, DumpError>>) -> DumpStream {
        futures::stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn test_gzip_output_decodes_to_input() {
        let chunks: Vec<Result<Vec<u8>, DumpError>> =
            (0..50).map(|i| Ok(format!("row {}\n", i).repeat(200).into_bytes())).collect();
        let expected: Vec<u8> = chunks.iter().flat_map(|c| c.as_ref().unwrap().clone()).collect();

        let mut compressed = Vec::new();
        let mut stream = gzip(source(chunks));
        while let Some(chunk) = stream.next().await {
            compressed.extend(chunk.unwrap());
        }
        assert!(compressed.len() < expected.len());

        let mut decoded = Vec::new();
        GzDecoder::new(&compressed[..]).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, expected);
    }

    #[tokio::test]
    async fn test_gzip_passes_errors_through() {
        let mut stream = gzip(source(vec![
            Ok(b"data".to_vec()),
            Err(DumpError::Timeout(std::time::Duration::from_secs(1))),
        ]));

        let mut saw_error = false;
        while let Some(item) = stream.next().await {
            if let Err(e) = item {
                assert!(matches!(e, DumpError::Timeout(_)));
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_no_compression_is_identity() {
        let mut stream = compress(source(vec![Ok(b"abc".to_vec())]), Compression::None);
        assert_eq!(stream.next().await.unwrap().unwrap(), b"abc".to_vec());
        assert!(stream.next().await.is_none());
    }
}
