use ember_core::{bail, Error, Result};

/// Dimensions of one transformer layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransformerConfig {
    /// Model width: features per token.
    pub d_model: usize,
    /// Attention heads; must divide `d_model`.
    pub num_heads: usize,
    /// Hidden width of the feed-forward network.
    pub d_ff: usize,
}

impl TransformerConfig {
    pub fn new(d_model: usize, num_heads: usize, d_ff: usize) -> Self {
        TransformerConfig {
            d_model,
            num_heads,
            d_ff,
        }
    }

    /// Check that every size is non-zero and the heads split `d_model` evenly.
    pub fn validate(&self) -> Result<()> {
        if self.d_model == 0 || self.d_ff == 0 {
            bail!(
                "transformer dimensions must be non-zero: d_model={}, d_ff={}",
                self.d_model,
                self.d_ff
            );
        }
        check_heads(self.d_model, self.num_heads)
    }

    /// Width of one attention head.
    pub fn d_head(&self) -> usize {
        self.d_model / self.num_heads.max(1)
    }

    /// Total number of scalar parameters in one block.
    pub fn parameter_count(&self) -> usize {
        let d = self.d_model;
        4 * d * d + 2 * d * self.d_ff + 4 * d
    }
}

pub(crate) fn check_heads(d_model: usize, num_heads: usize) -> Result<()> {
    if num_heads == 0 || d_model % num_heads != 0 {
        return Err(Error::HeadsMismatch { d_model, num_heads });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::ErrorKind;

    #[test]
    fn test_validate() {
        assert!(TransformerConfig::new(8, 2, 16).validate().is_ok());

        let err = TransformerConfig::new(10, 3, 16).validate().unwrap_err();
        assert!(matches!(
            err,
            Error::HeadsMismatch {
                d_model: 10,
                num_heads: 3
            }
        ));
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);

        assert!(TransformerConfig::new(8, 0, 16).validate().is_err());
        assert!(TransformerConfig::new(8, 2, 0).validate().is_err());
    }

    #[test]
    fn test_sizes() {
        let cfg = TransformerConfig::new(8, 2, 16);
        assert_eq!(cfg.d_head(), 4);
        // 4 projections, 2 feed-forward weights, 2 gamma/beta pairs
        assert_eq!(cfg.parameter_count(), 4 * 64 + 2 * 128 + 32);
    }
}
