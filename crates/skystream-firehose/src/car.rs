//! CAR block parsing for commit events.
//!
//! A `#commit` frame carries the blocks it touched as a CAR v1 slice; this
//! module indexes those blocks by CID and resolves each operation to its
//! record value.

use std::collections::HashMap;
use std::io::Cursor;

use ipld_core::cid::Cid;
use ipld_core::ipld::Ipld;
use iroh_car::CarReader;
use tracing::{trace, warn};

use crate::FirehoseError;
use crate::event::{CommitEvent, OpAction};

/// A commit operation resolved against the commit's blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRecord {
    pub action: OpAction,
    pub collection: String,
    pub rkey: String,
    pub cid: Option<Cid>,
    /// Decoded record value; None for deletes or when the block is absent.
    pub record: Option<Ipld>,
}

/// Parse CAR blocks from a commit, keyed by CID string.
pub async fn parse_commit_blocks(data: &[u8]) -> Result<HashMap<String, Vec<u8>>, FirehoseError> {
    let cursor = Cursor::new(data);
    let mut reader = CarReader::new(cursor)
        .await
        .map_err(|e| FirehoseError::CarParse(format!("failed to read commit CAR: {}", e)))?;

    let mut blocks = HashMap::new();

    loop {
        match reader.next_block().await {
            Ok(Some((cid, data))) => {
                blocks.insert(cid.to_string(), data);
            }
            Ok(None) => break,
            Err(e) => {
                return Err(FirehoseError::CarParse(format!(
                    "failed to read block: {}",
                    e
                )));
            }
        }
    }

    Ok(blocks)
}

impl CommitEvent {
    /// Resolve each operation to its collection, rkey and record value.
    ///
    /// Operations with malformed paths are skipped. A create/update whose
    /// block is missing from the CAR slice yields `record: None`.
    pub async fn records(&self) -> Result<Vec<CommitRecord>, FirehoseError> {
        let blocks = if self.blocks.is_empty() {
            HashMap::new()
        } else {
            parse_commit_blocks(&self.blocks).await?
        };

        let mut records = Vec::with_capacity(self.ops.len());

        for op in &self.ops {
            let Some((collection, rkey)) = op.collection_and_rkey() else {
                warn!(path = %op.path, "malformed record path, skipping");
                continue;
            };

            let record = match (&op.action, op.cid) {
                (OpAction::Create | OpAction::Update, Some(cid)) => {
                    match blocks.get(&cid.to_string()) {
                        Some(data) => Some(serde_ipld_dagcbor::from_slice::<Ipld>(data).map_err(
                            |e| FirehoseError::CarParse(format!("failed to decode record {}: {}", cid, e)),
                        )?),
                        None => {
                            trace!(cid = %cid, path = %op.path, "record block not in commit");
                            None
                        }
                    }
                }
                _ => None,
            };

            records.push(CommitRecord {
                action: op.action.clone(),
                collection: collection.to_string(),
                rkey: rkey.to_string(),
                cid: op.cid,
                record,
            });
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RepoOp;
    use crate::frame::IpldMap;
    use ipld_core::cid::multihash::Multihash;
    use iroh_car::{CarHeader, CarWriter};
    use pretty_assertions::assert_eq;

    const DAG_CBOR: u64 = 0x71;
    const SHA2_256: u64 = 0x12;

    fn cid(fill: u8) -> Cid {
        Cid::new_v1(DAG_CBOR, Multihash::<64>::wrap(SHA2_256, &[fill; 32]).unwrap())
    }

    async fn car(root: Cid, blocks: Vec<(Cid, Vec<u8>)>) -> Vec<u8> {
        let mut writer = CarWriter::new(CarHeader::new_v1(vec![root]), Vec::new());
        for (cid, data) in blocks {
            writer.write(cid, data).await.unwrap();
        }
        writer.finish().await.unwrap()
    }

    fn commit(ops: Vec<RepoOp>, blocks: Vec<u8>) -> CommitEvent {
        CommitEvent {
            seq: 1,
            repo: "did:plc:alice".to_string(),
            rev: "3kabc".to_string(),
            since: None,
            commit: None,
            ops,
            blocks,
            too_big: false,
            time: None,
            body: IpldMap::new(),
        }
    }

    #[tokio::test]
    async fn test_records_without_blocks() {
        let event = commit(
            vec![
                RepoOp {
                    action: OpAction::Delete,
                    path: "app.bsky.feed.like/3abc".to_string(),
                    cid: None,
                },
                RepoOp {
                    action: OpAction::Create,
                    path: "malformed".to_string(),
                    cid: None,
                },
            ],
            Vec::new(),
        );

        let records = event.records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].collection, "app.bsky.feed.like");
        assert_eq!(records[0].rkey, "3abc");
        assert_eq!(records[0].record, None);
    }

    #[tokio::test]
    async fn test_records_resolved_from_car() {
        let commit_cid = cid(1);
        let post_cid = cid(2);
        let missing_cid = cid(3);

        let mut post = IpldMap::new();
        post.insert("text".to_string(), Ipld::String("hello".to_string()));
        let post = Ipld::Map(post);

        let blocks = car(
            commit_cid,
            vec![
                (commit_cid, serde_ipld_dagcbor::to_vec(&Ipld::Map(IpldMap::new())).unwrap()),
                (post_cid, serde_ipld_dagcbor::to_vec(&post).unwrap()),
            ],
        )
        .await;

        let parsed = parse_commit_blocks(&blocks).await.unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed.contains_key(&post_cid.to_string()));

        let event = commit(
            vec![
                RepoOp {
                    action: OpAction::Create,
                    path: "app.bsky.feed.post/3kone".to_string(),
                    cid: Some(post_cid),
                },
                RepoOp {
                    action: OpAction::Create,
                    path: "app.bsky.feed.post/3ktwo".to_string(),
                    cid: Some(missing_cid),
                },
            ],
            blocks,
        );

        let records = event.records().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].rkey, "3kone");
        assert_eq!(records[0].cid, Some(post_cid));
        assert_eq!(records[0].record, Some(post));
        assert_eq!(records[1].rkey, "3ktwo");
        assert_eq!(records[1].record, None);
    }

    #[tokio::test]
    async fn test_invalid_car_fails() {
        let event = commit(
            vec![RepoOp {
                action: OpAction::Create,
                path: "app.bsky.feed.post/3xyz".to_string(),
                cid: None,
            }],
            vec![0xFF, 0x00, 0x01],
        );
        assert!(matches!(
            event.records().await,
            Err(FirehoseError::CarParse(_))
        ));
    }
}
