//! Parity Codecs
//!
//! Galois-field full-stripe encode and incremental parity update. The
//! Reed-Solomon codec wraps the `reed-solomon-erasure` crate; the XOR codec is
//! the trivial single-parity code.
//!
//! All buffers are flat: `k` (or `p`) consecutive cells of `cell_bytes` each.
//! Parity is linear over GF(2^8), so for a change `diff = old ^ new` in data
//! cell `i`:
//!
//! ```text
//! parity_j' = parity_j ^ (coef[j][i] * diff)
//! ```

use std::fmt;
use std::sync::Arc;

use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::geometry::EcAttr;
use crate::error::{Error, Result};

/// Full-encode and incremental-update primitives for one geometry.
pub trait ParityCodec: Send + Sync + fmt::Debug {
    /// Number of data cells (k)
    fn data_cells(&self) -> usize;

    /// Number of parity cells (p)
    fn parity_cells(&self) -> usize;

    /// Compute all `p` parity cells from `k` data cells.
    fn encode(&self, data: &[u8], parity: &mut [u8]) -> Result<()>;

    /// Fold a change to data cell `cell` into existing parity.
    fn update(&self, cell: usize, diff: &[u8], parity: &mut [u8]) -> Result<()>;
}

/// Codec family selected per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Reed-Solomon over GF(2^8)
    #[default]
    ReedSolomon,
    /// Plain XOR, single parity only
    Xor,
}

/// Build the codec of `kind` for `attr`.
pub fn codec_for(attr: &EcAttr, kind: CodecKind) -> Result<Arc<dyn ParityCodec>> {
    attr.validate()?;
    let codec: Arc<dyn ParityCodec> = match kind {
        CodecKind::ReedSolomon => Arc::new(RsCodec::new(attr.k as usize, attr.p as usize)?),
        CodecKind::Xor => Arc::new(XorCodec::new(attr.k as usize, attr.p as usize)?),
    };
    Ok(codec)
}

/// Cell size in bytes implied by a flat data buffer.
fn cell_bytes_of(data_len: usize, cells: usize) -> usize {
    assert!(
        cells > 0 && data_len % cells == 0,
        "buffer of {data_len} bytes does not hold {cells} whole cells"
    );
    data_len / cells
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    assert_eq!(dst.len(), src.len(), "xor of mismatched cells");
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= *s;
    }
}

// =============================================================================
// Reed-Solomon Codec
// =============================================================================

/// Reed-Solomon codec over GF(2^8)
pub struct RsCodec {
    /// Reed-Solomon codec instance
    rs: Arc<ReedSolomon>,
    /// Number of data cells (k)
    data_cells: usize,
    /// Number of parity cells (p)
    parity_cells: usize,
}

impl fmt::Debug for RsCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsCodec")
            .field("data_cells", &self.data_cells)
            .field("parity_cells", &self.parity_cells)
            .finish()
    }
}

impl RsCodec {
    /// Create a new codec with the specified k+p configuration
    pub fn new(data_cells: usize, parity_cells: usize) -> Result<Self> {
        if data_cells == 0 {
            return Err(Error::InvalidEcConfig(
                "data_cells must be greater than 0".to_string(),
            ));
        }
        if parity_cells == 0 {
            return Err(Error::InvalidEcConfig(
                "parity_cells must be greater than 0".to_string(),
            ));
        }

        let rs = ReedSolomon::new(data_cells, parity_cells).map_err(|e| {
            Error::InvalidEcConfig(format!("Failed to create Reed-Solomon codec: {}", e))
        })?;

        Ok(Self {
            rs: Arc::new(rs),
            data_cells,
            parity_cells,
        })
    }
}

impl ParityCodec for RsCodec {
    fn data_cells(&self) -> usize {
        self.data_cells
    }

    fn parity_cells(&self) -> usize {
        self.parity_cells
    }

    #[instrument(skip(self, data, parity), fields(data_len = data.len()))]
    fn encode(&self, data: &[u8], parity: &mut [u8]) -> Result<()> {
        let cell_bytes = cell_bytes_of(data.len(), self.data_cells);
        assert_eq!(
            parity.len(),
            cell_bytes * self.parity_cells,
            "parity buffer does not match {} cells",
            self.parity_cells
        );

        let data_cells: Vec<&[u8]> = data.chunks(cell_bytes).collect();
        let mut parity_cells: Vec<&mut [u8]> = parity.chunks_mut(cell_bytes).collect();

        self.rs
            .encode_sep(&data_cells[..], &mut parity_cells[..])
            .map_err(|e| Error::EcEncodingFailed(format!("Reed-Solomon encoding failed: {}", e)))?;

        debug!(
            "Encoded {} data cells of {} bytes into {} parity cells",
            self.data_cells, cell_bytes, self.parity_cells
        );
        Ok(())
    }

    fn update(&self, cell: usize, diff: &[u8], parity: &mut [u8]) -> Result<()> {
        assert!(cell < self.data_cells, "cell {cell} out of range");
        let cell_bytes = diff.len();
        assert_eq!(
            parity.len(),
            cell_bytes * self.parity_cells,
            "parity buffer does not match {} cells",
            self.parity_cells
        );

        // Contribution of `diff` alone, then added into the live parity.
        let mut delta = vec![0u8; parity.len()];
        {
            let mut delta_cells: Vec<&mut [u8]> = delta.chunks_mut(cell_bytes).collect();
            self.rs
                .encode_single_sep(cell, diff, &mut delta_cells[..])
                .map_err(|e| {
                    Error::EcEncodingFailed(format!("Reed-Solomon update failed: {}", e))
                })?;
        }
        xor_into(parity, &delta);
        Ok(())
    }
}

// =============================================================================
// XOR Codec
// =============================================================================

/// Single-parity XOR code: `parity = d0 ^ d1 ^ ... ^ d(k-1)`.
#[derive(Debug, Clone)]
pub struct XorCodec {
    data_cells: usize,
}

impl XorCodec {
    pub fn new(data_cells: usize, parity_cells: usize) -> Result<Self> {
        if data_cells == 0 {
            return Err(Error::InvalidEcConfig(
                "data_cells must be greater than 0".to_string(),
            ));
        }
        if parity_cells != 1 {
            return Err(Error::InvalidEcConfig(format!(
                "XOR codec supports exactly one parity cell, got {}",
                parity_cells
            )));
        }
        Ok(Self { data_cells })
    }
}

impl ParityCodec for XorCodec {
    fn data_cells(&self) -> usize {
        self.data_cells
    }

    fn parity_cells(&self) -> usize {
        1
    }

    fn encode(&self, data: &[u8], parity: &mut [u8]) -> Result<()> {
        let cell_bytes = cell_bytes_of(data.len(), self.data_cells);
        assert_eq!(parity.len(), cell_bytes, "parity buffer is not one cell");
        parity.fill(0);
        for cell in data.chunks(cell_bytes) {
            xor_into(parity, cell);
        }
        Ok(())
    }

    fn update(&self, cell: usize, diff: &[u8], parity: &mut [u8]) -> Result<()> {
        assert!(cell < self.data_cells, "cell {cell} out of range");
        xor_into(parity, diff);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
