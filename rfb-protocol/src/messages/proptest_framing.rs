//! Property tests for cache message framing.
//!
//! These tests verify that cache message parsing is robust against
//! fragmentation at arbitrary byte boundaries, which is critical for correct
//! operation over real network streams.

#[cfg(test)]
mod tests {
    use super::super::cache::*;
    use crate::io::{RfbInStream, RfbOutStream};
    use proptest::prelude::*;
    use rfb_common::CacheKey;

    /// A fragmenting reader that splits reads at a specific boundary.
    ///
    /// This simulates network fragmentation by only allowing reads up to
    /// a specific position, then requiring a second read for the rest.
    struct FragmentingReader {
        data: Vec<u8>,
        pos: usize,
        boundary: usize,
    }

    impl FragmentingReader {
        fn new(data: Vec<u8>, boundary: usize) -> Self {
            let boundary = boundary.min(data.len());
            Self {
                data,
                pos: 0,
                boundary,
            }
        }
    }

    impl tokio::io::AsyncRead for FragmentingReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if self.pos >= self.data.len() {
                return std::task::Poll::Ready(Ok(()));
            }

            // Only read up to boundary on first pass, or remaining data after
            let available = if self.pos < self.boundary {
                (self.boundary - self.pos).min(buf.remaining())
            } else {
                (self.data.len() - self.pos).min(buf.remaining())
            };

            if available == 0 {
                return std::task::Poll::Ready(Ok(()));
            }

            let data = &self.data[self.pos..self.pos + available];
            buf.put_slice(data);
            self.pos += available;

            std::task::Poll::Ready(Ok(()))
        }
    }

    fn arbitrary_key() -> impl Strategy<Value = CacheKey> {
        prop::array::uniform16(1u8..=255).prop_map(CacheKey::from_bytes)
    }

    async fn serialize(msg: &ClientCacheMessage) -> Vec<u8> {
        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        msg.write_to(&mut out).unwrap();
        out.flush().await.unwrap();
        buffer
    }

    async fn parse_fragmented(data: Vec<u8>, boundary: usize) -> ClientCacheMessage {
        let reader = FragmentingReader::new(data, boundary);
        let mut stream = RfbInStream::new(reader);
        let msg_type = stream.read_u8().await.unwrap();
        ClientCacheMessage::read_from(msg_type, &mut stream)
            .await
            .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn eviction_parses_across_any_boundary(
            ids in prop::collection::vec(1u64..u64::MAX, 0..40),
            boundary in 0usize..512,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            rt.block_on(async {
                let msg = ClientCacheMessage::CacheEviction(CacheEviction {
                    content_ids: ids.clone(),
                });
                let bytes = serialize(&msg).await;
                let parsed = parse_fragmented(bytes, boundary).await;
                assert_eq!(parsed, msg);
            });
        }

        #[test]
        fn query_parses_across_any_boundary(
            keys in prop::collection::vec(arbitrary_key(), 0..20),
            boundary in 0usize..512,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            rt.block_on(async {
                let msg = ClientCacheMessage::PersistentCacheQuery(PersistentCacheQuery {
                    keys: keys.clone(),
                });
                let bytes = serialize(&msg).await;
                let parsed = parse_fragmented(bytes, boundary).await;
                assert_eq!(parsed, msg);
            });
        }

        #[test]
        fn hash_report_parses_across_any_boundary(
            canonical in arbitrary_key(),
            actual in arbitrary_key(),
            boundary in 0usize..40,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            rt.block_on(async {
                let msg = ClientCacheMessage::HashReport(PersistentCacheHashReport {
                    canonical,
                    actual,
                });
                let bytes = serialize(&msg).await;
                let parsed = parse_fragmented(bytes, boundary).await;
                assert_eq!(parsed, msg);
            });
        }

        #[test]
        fn hash_list_chunks_reassemble_to_input(
            ids in prop::collection::vec(1u64..u64::MAX, 0..6000),
            sequence in 0u32..u32::MAX,
        ) {
            let chunks = PersistentHashList::chunked(sequence, &ids);
            prop_assert!(!chunks.is_empty());
            prop_assert!(chunks.iter().all(|c| c.total_chunks as usize == chunks.len()));
            let collected: Vec<u64> = chunks
                .iter()
                .flat_map(|c| c.content_ids.iter().copied())
                .collect();
            prop_assert_eq!(collected, ids);
        }
    }
}
