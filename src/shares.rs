//! Secret-shared values and the encoder/decoder wrapped around the share primitive.
//!
//! Every plaintext value becomes a [`ShareBundle`]: one [`Share`] per node, index-aligned
//! with the node registry. Integers (fixed-point encoded floats) are split additively
//! modulo [`PRIME_MODULUS`]; byte blobs are split with XOR pads. The pipelines only see the
//! [`SecretSharer`] trait, so the primitive can be swapped without touching them.

use rand::{Rng, RngCore};

use crate::error::{RagError, Result};
use crate::fixed_point::{self, PRECISION};

/// Public prime the additive shares live under (2^32 + 15).
pub const PRIME_MODULUS: u64 = 4_294_967_311;

/// Discriminant of a [`Share`] payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareKind {
    /// One integer share.
    Scalar,
    /// Several integer shares belonging to the same party, e.g. a difference vector.
    Vector,
    /// XOR share of an opaque blob.
    Bytes,
}

/// Party-local payload of a share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharePayload {
    /// See [`ShareKind::Scalar`].
    Scalar(i64),
    /// See [`ShareKind::Vector`].
    Vector(Vec<i64>),
    /// See [`ShareKind::Bytes`].
    Bytes(Vec<u8>),
}

/// One party's fragment of a secret, tagged with the fixed-point precision of the plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    /// Decimal digits of fixed-point scaling; `0` for integers and blobs.
    pub precision: u32,
    /// The fragment itself.
    pub payload: SharePayload,
}

impl Share {
    /// Integer share carrying `precision`.
    pub fn scalar(precision: u32, value: i64) -> Self {
        Self {
            precision,
            payload: SharePayload::Scalar(value),
        }
    }

    /// Vector share carrying `precision`.
    pub fn vector(precision: u32, values: Vec<i64>) -> Self {
        Self {
            precision,
            payload: SharePayload::Vector(values),
        }
    }

    /// Blob share.
    pub fn bytes(value: Vec<u8>) -> Self {
        Self {
            precision: 0,
            payload: SharePayload::Bytes(value),
        }
    }

    /// Payload discriminant.
    pub fn kind(&self) -> ShareKind {
        match self.payload {
            SharePayload::Scalar(_) => ShareKind::Scalar,
            SharePayload::Vector(_) => ShareKind::Vector,
            SharePayload::Bytes(_) => ShareKind::Bytes,
        }
    }

    /// Integer payload, if this is a scalar share.
    pub fn as_scalar(&self) -> Option<i64> {
        match self.payload {
            SharePayload::Scalar(value) => Some(value),
            _ => None,
        }
    }

    /// Blob payload, if this is a bytes share.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            SharePayload::Bytes(value) => Some(value),
            _ => None,
        }
    }
}

/// One share per node, index-aligned with the registry.
pub type ShareBundle = Vec<Share>;

/// The opaque share primitive: `Encrypt(key, value) -> shares` and its inverse.
pub trait SecretSharer: Send + Sync {
    /// Number of parties every value is split across.
    fn parties(&self) -> usize;

    /// Splits an integer into `parties()` additive shares.
    fn share_int(&self, value: i64) -> Vec<i64>;

    /// Recombines additive shares into a signed integer.
    fn reveal_int(&self, shares: &[i64]) -> i64;

    /// Largest magnitude accepted at encode time.
    ///
    /// The difference of two accepted values must still reconstruct, so this is at most a
    /// quarter of the modulus.
    fn max_magnitude(&self) -> i64;

    /// Splits a blob into `parties()` shares of the same length.
    fn share_bytes(&self, blob: &[u8]) -> Vec<Vec<u8>>;

    /// Recombines blob shares.
    fn reveal_bytes(&self, shares: &[Vec<u8>]) -> Result<Vec<u8>>;
}

/// Additive sharing modulo a public prime for integers, XOR pads for blobs.
#[derive(Debug, Clone)]
pub struct AdditiveSharing {
    parties: usize,
    modulus: u64,
}

impl AdditiveSharing {
    /// Sharing across `parties` nodes under [`PRIME_MODULUS`].
    pub fn new(parties: usize) -> Result<Self> {
        Self::with_modulus(parties, PRIME_MODULUS)
    }

    /// Sharing under a caller-chosen odd modulus.
    pub fn with_modulus(parties: usize, modulus: u64) -> Result<Self> {
        if parties == 0 {
            return Err(RagError::Config("secret sharing needs at least one party".into()));
        }
        if modulus < 3 {
            return Err(RagError::Config(format!("modulus {modulus} is too small")));
        }
        Ok(Self { parties, modulus })
    }

    /// Modulus shares are reduced under.
    pub fn modulus(&self) -> u64 {
        self.modulus
    }

    fn reduce(&self, value: i128) -> u64 {
        value.rem_euclid(i128::from(self.modulus)) as u64
    }
}

impl SecretSharer for AdditiveSharing {
    fn parties(&self) -> usize {
        self.parties
    }

    fn share_int(&self, value: i64) -> Vec<i64> {
        let mut rng = rand::thread_rng();
        let mut shares = Vec::with_capacity(self.parties);
        let mut sum: i128 = 0;
        for _ in 1..self.parties {
            let share = rng.gen_range(0..self.modulus);
            sum += i128::from(share);
            shares.push(share as i64);
        }
        let last = self.reduce(i128::from(value) - sum);
        shares.push(last as i64);
        shares
    }

    fn reveal_int(&self, shares: &[i64]) -> i64 {
        let total: i128 = shares.iter().map(|s| i128::from(*s)).sum();
        let reduced = self.reduce(total);
        if reduced > self.modulus / 2 {
            reduced as i64 - self.modulus as i64
        } else {
            reduced as i64
        }
    }

    fn max_magnitude(&self) -> i64 {
        (self.modulus / 4) as i64
    }

    fn share_bytes(&self, blob: &[u8]) -> Vec<Vec<u8>> {
        let mut rng = rand::thread_rng();
        let mut last = blob.to_vec();
        let mut shares = Vec::with_capacity(self.parties);
        for _ in 1..self.parties {
            let mut pad = vec![0u8; blob.len()];
            rng.fill_bytes(&mut pad);
            for (byte, mask) in last.iter_mut().zip(&pad) {
                *byte ^= mask;
            }
            shares.push(pad);
        }
        shares.push(last);
        shares
    }

    fn reveal_bytes(&self, shares: &[Vec<u8>]) -> Result<Vec<u8>> {
        let Some(first) = shares.first() else {
            return Err(RagError::Reconstruction("no blob shares supplied".into()));
        };
        if shares.iter().any(|share| share.len() != first.len()) {
            return Err(RagError::Reconstruction(
                "blob shares have different lengths".into(),
            ));
        }
        let mut out = vec![0u8; first.len()];
        for share in shares {
            for (byte, part) in out.iter_mut().zip(share) {
                *byte ^= part;
            }
        }
        Ok(out)
    }
}

/// Fixed-point encodes and shares every element: `D` bundles of width `N`.
///
/// Non-finite elements and elements whose scaled magnitude exceeds
/// [`SecretSharer::max_magnitude`] are rejected with [`RagError::Input`].
pub fn encrypt_vector(sharer: &dyn SecretSharer, values: &[f32]) -> Result<Vec<ShareBundle>> {
    let limit = sharer.max_magnitude();
    let mut bundles = Vec::with_capacity(values.len());
    for (index, value) in values.iter().enumerate() {
        if !value.is_finite() {
            return Err(RagError::Input(format!("element {index} is not finite")));
        }
        let scaled = fixed_point::to_fixed_point(f64::from(*value));
        if scaled.abs() > limit {
            return Err(RagError::Input(format!(
                "element {index} ({value}) is outside the shareable range of +/-{}",
                fixed_point::from_fixed_point(limit)
            )));
        }
        bundles.push(
            sharer
                .share_int(scaled)
                .into_iter()
                .map(|share| Share::scalar(PRECISION, share))
                .collect(),
        );
    }
    Ok(bundles)
}

/// Shares an opaque blob.
pub fn encrypt_bytes(sharer: &dyn SecretSharer, blob: &[u8]) -> ShareBundle {
    sharer.share_bytes(blob).into_iter().map(Share::bytes).collect()
}

/// Recombines a scalar bundle into its float value.
pub fn decrypt_scalar(sharer: &dyn SecretSharer, bundle: &[Share]) -> Result<f64> {
    let precision = check_bundle(sharer, bundle, ShareKind::Scalar)?;
    let raw: Vec<i64> = bundle.iter().filter_map(Share::as_scalar).collect();
    Ok(descale(sharer.reveal_int(&raw), precision))
}

/// Recombines a blob bundle.
pub fn decrypt_bytes(sharer: &dyn SecretSharer, bundle: &[Share]) -> Result<Vec<u8>> {
    check_bundle(sharer, bundle, ShareKind::Bytes)?;
    let raw: Vec<Vec<u8>> = bundle
        .iter()
        .filter_map(|share| share.as_bytes().map(<[u8]>::to_vec))
        .collect();
    sharer.reveal_bytes(&raw)
}

/// Recombines one vector share per node element-wise into plaintext floats.
pub fn decrypt_vector(sharer: &dyn SecretSharer, per_node: &[Share]) -> Result<Vec<f64>> {
    let precision = check_bundle(sharer, per_node, ShareKind::Vector)?;
    let vectors: Vec<&[i64]> = per_node
        .iter()
        .filter_map(|share| match &share.payload {
            SharePayload::Vector(values) => Some(values.as_slice()),
            _ => None,
        })
        .collect();
    let dims = vectors[0].len();
    if vectors.iter().any(|v| v.len() != dims) {
        return Err(RagError::Reconstruction(
            "vector shares have different dimensions".into(),
        ));
    }
    let mut column = Vec::with_capacity(vectors.len());
    let mut out = Vec::with_capacity(dims);
    for dim in 0..dims {
        column.clear();
        column.extend(vectors.iter().map(|v| v[dim]));
        out.push(descale(sharer.reveal_int(&column), precision));
    }
    Ok(out)
}

/// Transposes `D` bundles of width `N` into `N` raw per-node vectors.
pub fn split_by_node(bundles: &[ShareBundle], parties: usize) -> Result<Vec<Vec<i64>>> {
    let mut per_node = vec![Vec::with_capacity(bundles.len()); parties];
    for (dim, bundle) in bundles.iter().enumerate() {
        if bundle.len() != parties {
            return Err(RagError::Input(format!(
                "element {dim} has {} shares for {parties} nodes",
                bundle.len()
            )));
        }
        for (node, share) in bundle.iter().enumerate() {
            let value = share.as_scalar().ok_or_else(|| {
                RagError::Input(format!("element {dim} holds a non-scalar share"))
            })?;
            per_node[node].push(value);
        }
    }
    Ok(per_node)
}

fn check_bundle(sharer: &dyn SecretSharer, bundle: &[Share], kind: ShareKind) -> Result<u32> {
    if bundle.len() != sharer.parties() {
        return Err(RagError::Reconstruction(format!(
            "expected {} shares, got {}",
            sharer.parties(),
            bundle.len()
        )));
    }
    let precision = bundle[0].precision;
    for share in bundle {
        if share.kind() != kind {
            return Err(RagError::Reconstruction(format!(
                "expected {kind:?} share, got {:?}",
                share.kind()
            )));
        }
        if share.precision != precision {
            return Err(RagError::Reconstruction(format!(
                "precision mismatch: {} vs {precision}",
                share.precision
            )));
        }
    }
    Ok(precision)
}

fn descale(value: i64, precision: u32) -> f64 {
    if precision == 0 {
        value as f64
    } else {
        value as f64 / 10f64.powi(precision as i32)
    }
}
