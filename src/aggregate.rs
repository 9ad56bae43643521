//! Grouping of per-node answers by document id and reconstruction of complete groups.
//!
//! A document is usable only when every node answered for it. Incomplete groups and
//! groups that fail to reconstruct are dropped here and reported through the returned
//! counters; deciding whether an empty outcome is an error is left to the caller.

use std::collections::HashMap;

use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::fixed_point::PRECISION;
use crate::records::{ChunkRecord, DifferenceRecord};
use crate::shares::{decrypt_bytes, decrypt_vector, SecretSharer, Share};

/// Shares gathered for one id, slot `i` filled by node `i`.
struct Group<T> {
    id: Uuid,
    slots: Vec<Option<T>>,
}

/// Groups `per_node[i]` (node `i`'s rows) by id in first-seen order.
///
/// Only groups with a value from every node are returned. A node repeating an id keeps
/// its first row.
pub fn group_complete<R, T>(
    per_node: Vec<Vec<R>>,
    id_of: impl Fn(&R) -> Uuid,
    value_of: impl Fn(R) -> T,
) -> (Vec<(Uuid, Vec<T>)>, usize) {
    let parties = per_node.len();
    let mut index: HashMap<Uuid, usize> = HashMap::new();
    let mut groups: Vec<Group<T>> = Vec::new();
    for (node, rows) in per_node.into_iter().enumerate() {
        for row in rows {
            let id = id_of(&row);
            let slot = *index.entry(id).or_insert_with(|| {
                groups.push(Group {
                    id,
                    slots: (0..parties).map(|_| None).collect(),
                });
                groups.len() - 1
            });
            let cell = &mut groups[slot].slots[node];
            if cell.is_none() {
                *cell = Some(value_of(row));
            }
        }
    }
    let seen = groups.len();
    let complete: Vec<(Uuid, Vec<T>)> = groups
        .into_iter()
        .filter_map(|group| {
            let values: Option<Vec<T>> = group.slots.into_iter().collect();
            values.map(|values| (group.id, values))
        })
        .collect();
    let incomplete = seen - complete.len();
    (complete, incomplete)
}

/// Distance of one document to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredDocument {
    /// Document id.
    pub id: Uuid,
    /// Euclidean norm of the reconstructed difference vector.
    pub distance: f64,
}

/// Outcome of reconstructing a fan-out's answers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregated<T> {
    /// Reconstructed documents in first-seen order.
    pub documents: Vec<T>,
    /// Ids missing an answer from at least one node.
    pub incomplete: usize,
    /// Ids whose shares did not reconstruct.
    pub rejected: usize,
}

/// Reconstructs a distance for every id that all nodes returned a difference for.
pub fn aggregate_differences(
    sharer: &dyn SecretSharer,
    per_node: Vec<Vec<DifferenceRecord>>,
) -> Aggregated<ScoredDocument> {
    let (groups, incomplete) = group_complete(per_node, |row| row.id, |row| row.difference);
    let mut out = Aggregated {
        documents: Vec::with_capacity(groups.len()),
        incomplete,
        rejected: 0,
    };
    for (id, differences) in groups {
        match reconstruct_distance(sharer, differences) {
            Ok(distance) => out.documents.push(ScoredDocument { id, distance }),
            Err(err) => {
                debug!(document = %id, error = %err, "dropping document");
                out.rejected += 1;
            }
        }
    }
    out
}

fn reconstruct_distance(sharer: &dyn SecretSharer, differences: Vec<Vec<i64>>) -> Result<f64> {
    let shares: Vec<Share> = differences
        .into_iter()
        .map(|values| Share::vector(PRECISION, values))
        .collect();
    let plain = decrypt_vector(sharer, &shares)?;
    Ok(euclidean_norm(&plain))
}

/// `sqrt(sum(x^2))`.
pub fn euclidean_norm(values: &[f64]) -> f64 {
    values.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Reconstructs the plaintext chunk of every id that all nodes returned.
pub fn aggregate_chunks(
    sharer: &dyn SecretSharer,
    per_node: Vec<Vec<ChunkRecord>>,
) -> Aggregated<(Uuid, Vec<u8>)> {
    let (groups, incomplete) = group_complete(per_node, |row| row.id, |row| row);
    let mut out = Aggregated {
        documents: Vec::with_capacity(groups.len()),
        incomplete,
        rejected: 0,
    };
    for (id, rows) in groups {
        let revealed = rows
            .iter()
            .map(|row| row.share_bytes().map(Share::bytes))
            .collect::<Result<Vec<Share>>>()
            .and_then(|bundle| decrypt_bytes(sharer, &bundle));
        match revealed {
            Ok(bytes) => out.documents.push((id, bytes)),
            Err(err) => {
                debug!(document = %id, error = %err, "dropping chunk");
                out.rejected += 1;
            }
        }
    }
    out
}
