//! Layer Checkpoints
//!
//! Saves one layer as its configuration plus its flat parameter buffer. The
//! buffer is the unit of persistence: on load it is re-sliced against the
//! layout the configuration implies, so it must have exactly the expected
//! length.
//!
//! ## File Format
//!
//! ```text
//! b"ADDATT_CKPT"            magic header (11 bytes)
//! u8                        format version (1)
//! u8                        layout variant (0 = fixed query, 1 = recurrent query)
//! u32 LE + bytes            LayerConfig as JSON
//! u32 LE + f32 LE × n       parameter buffer
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use additive_attention::{Checkpoint, LayerConfig, SelfAttentionLayer};
//!
//! let layer = SelfAttentionLayer::new(LayerConfig::new(8, 2))?;
//! Checkpoint::from(&layer).save("pooling.ckpt")?;
//!
//! let restored = Checkpoint::load("pooling.ckpt")?.into_self_attention()?;
//! assert_eq!(restored.params(), layer.params());
//! # Ok::<(), additive_attention::AttentionError>(())
//! ```

use crate::config::LayerConfig;
use crate::error::{AttentionError, Result};
use crate::layers::{RecurrentAttentionLayer, SelfAttentionLayer};
use crate::params::{LayoutVariant, ParamLayout};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::info;

const MAGIC: &[u8; 11] = b"ADDATT_CKPT";
const VERSION: u8 = 1;
/// Serialized `LayerConfig` is a few hundred bytes
const MAX_CONFIG_BYTES: usize = 1 << 16;

/// A layer's configuration and parameters
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub variant: LayoutVariant,
    pub config: LayerConfig,
    pub params: Vec<f32>,
}

fn invalid_data(message: String) -> AttentionError {
    AttentionError::Io(io::Error::new(io::ErrorKind::InvalidData, message))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

impl Checkpoint {
    /// Check that `params` fits the layout implied by `config`
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;
        ParamLayout::new(self.variant, self.config.n_in, self.config.n_out)?.reslice(&self.params)?;
        Ok(())
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_all(&[VERSION])?;
        let variant = match self.variant {
            LayoutVariant::FixedQuery => 0u8,
            LayoutVariant::RecurrentQuery => 1u8,
        };
        writer.write_all(&[variant])?;

        let config_json = serde_json::to_string(&self.config)?;
        writer.write_all(&(config_json.len() as u32).to_le_bytes())?;
        writer.write_all(config_json.as_bytes())?;

        writer.write_all(&(self.params.len() as u32).to_le_bytes())?;
        for &value in &self.params {
            writer.write_all(&value.to_le_bytes())?;
        }
        Ok(())
    }

    /// Read and validate a checkpoint
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 11];
        reader.read_exact(&mut header)?;
        if &header != MAGIC {
            return Err(invalid_data("invalid checkpoint header, expected ADDATT_CKPT".to_string()));
        }

        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        if byte[0] != VERSION {
            return Err(invalid_data(format!("unsupported checkpoint version: {}", byte[0])));
        }

        reader.read_exact(&mut byte)?;
        let variant = match byte[0] {
            0 => LayoutVariant::FixedQuery,
            1 => LayoutVariant::RecurrentQuery,
            other => return Err(invalid_data(format!("unknown layout variant tag: {other}"))),
        };

        let config_len = read_u32(reader)? as usize;
        if config_len > MAX_CONFIG_BYTES {
            return Err(invalid_data(format!(
                "checkpoint config of {config_len} bytes exceeds the {MAX_CONFIG_BYTES} byte limit"
            )));
        }
        let mut config_bytes = Vec::with_capacity(config_len);
        reader.by_ref().take(config_len as u64).read_to_end(&mut config_bytes)?;
        if config_bytes.len() != config_len {
            return Err(AttentionError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
        }
        let config: LayerConfig = serde_json::from_slice(&config_bytes)?;

        let count = read_u32(reader)? as usize;
        let expected = ParamLayout::new(variant, config.n_in, config.n_out)?.num_params();
        if count != expected {
            return Err(AttentionError::shape("checkpoint parameters", &[expected], &[count]));
        }
        let mut bytes = vec![0u8; count * 4];
        reader.read_exact(&mut bytes)?;
        let params = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        let checkpoint = Self {
            variant,
            config,
            params,
        };
        checkpoint.validate()?;
        Ok(checkpoint)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        info!(
            path = %path.display(),
            variant = ?self.variant,
            num_params = self.params.len(),
            "saved checkpoint"
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let checkpoint = Self::read_from(&mut BufReader::new(File::open(path)?))?;
        info!(
            path = %path.display(),
            variant = ?checkpoint.variant,
            num_params = checkpoint.params.len(),
            "loaded checkpoint"
        );
        Ok(checkpoint)
    }

    fn expect_variant(&self, variant: LayoutVariant) -> Result<()> {
        if self.variant != variant {
            return Err(AttentionError::InvalidConfig(format!(
                "checkpoint holds a {:?} layer, not {:?}",
                self.variant, variant
            )));
        }
        Ok(())
    }

    pub fn into_self_attention(self) -> Result<SelfAttentionLayer> {
        self.expect_variant(LayoutVariant::FixedQuery)?;
        SelfAttentionLayer::from_params(self.config, self.params)
    }

    pub fn into_recurrent_attention(self) -> Result<RecurrentAttentionLayer> {
        self.expect_variant(LayoutVariant::RecurrentQuery)?;
        RecurrentAttentionLayer::from_params(self.config, self.params)
    }
}

impl From<&SelfAttentionLayer> for Checkpoint {
    fn from(layer: &SelfAttentionLayer) -> Self {
        Self {
            variant: LayoutVariant::FixedQuery,
            config: layer.config().clone(),
            params: layer.params().to_vec(),
        }
    }
}

impl From<&RecurrentAttentionLayer> for Checkpoint {
    fn from(layer: &RecurrentAttentionLayer) -> Self {
        Self {
            variant: LayoutVariant::RecurrentQuery,
            config: layer.config().clone(),
            params: layer.params().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Activation, WeightInit};
    use std::io::Cursor;

    fn encode(checkpoint: &Checkpoint) -> Vec<u8> {
        let mut bytes = Vec::new();
        checkpoint.write_to(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_restores_self_attention_layer() {
        let config = LayerConfig::new(4, 3)
            .with_activation(Activation::Relu)
            .with_bias_init(WeightInit::Constant { value: 0.1 });
        let layer = SelfAttentionLayer::new(config).unwrap();
        let bytes = encode(&Checkpoint::from(&layer));

        let restored = Checkpoint::read_from(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(restored.variant, LayoutVariant::FixedQuery);
        let restored = restored.into_self_attention().unwrap();
        assert_eq!(restored.params(), layer.params());
        assert_eq!(restored.config(), layer.config());
    }

    #[test]
    fn test_save_and_load_file() {
        let layer = RecurrentAttentionLayer::new(LayerConfig::new(2, 3).with_seed(99)).unwrap();
        let path = std::env::temp_dir().join(format!("additive_attention_ckpt_{}.bin", std::process::id()));
        Checkpoint::from(&layer).save(&path).unwrap();
        let restored = Checkpoint::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(restored.clone().into_self_attention().is_err());
        let restored = restored.into_recurrent_attention().unwrap();
        assert_eq!(restored.params(), layer.params());
    }

    #[test]
    fn test_wrong_parameter_count_rejected() {
        let layer = SelfAttentionLayer::new(LayerConfig::new(2, 2)).unwrap();
        let mut checkpoint = Checkpoint::from(&layer);
        checkpoint.params.pop();
        let bytes = encode(&checkpoint);
        assert!(matches!(
            Checkpoint::read_from(&mut Cursor::new(bytes)),
            Err(AttentionError::ShapeMismatch { .. })
        ));
        assert!(checkpoint.into_self_attention().is_err());
    }

    #[test]
    fn test_bad_header_and_version() {
        let layer = SelfAttentionLayer::new(LayerConfig::new(1, 1)).unwrap();
        let mut bytes = encode(&Checkpoint::from(&layer));
        bytes[11] = 9;
        assert!(matches!(
            Checkpoint::read_from(&mut Cursor::new(bytes.clone())),
            Err(AttentionError::Io(_))
        ));
        bytes[0] = b'X';
        assert!(matches!(
            Checkpoint::read_from(&mut Cursor::new(bytes)),
            Err(AttentionError::Io(_))
        ));
        // Truncated stream
        assert!(Checkpoint::read_from(&mut Cursor::new(b"ADDATT".to_vec())).is_err());
    }

    #[test]
    fn test_corrupt_config_length_rejected() {
        let layer = SelfAttentionLayer::new(LayerConfig::new(1, 1)).unwrap();
        let bytes = encode(&Checkpoint::from(&layer));
        let len_at = MAGIC.len() + 2;

        // A huge length fails before any buffer of that size is made
        let mut huge = bytes.clone();
        huge[len_at..len_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            Checkpoint::read_from(&mut Cursor::new(huge)),
            Err(AttentionError::Io(e)) if e.kind() == io::ErrorKind::InvalidData
        ));

        // A plausible length past the end of the stream is a short read
        let config_len = u32::from_le_bytes([bytes[len_at], bytes[len_at + 1], bytes[len_at + 2], bytes[len_at + 3]]);
        let short = bytes[..len_at + 4 + config_len as usize / 2].to_vec();
        assert!(matches!(
            Checkpoint::read_from(&mut Cursor::new(short)),
            Err(AttentionError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof
        ));
    }
}
