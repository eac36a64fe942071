//! Generation parameters: weighted prompts and the musical configuration.
//!
//! `GenerationConfig` is a closed record. Unknown option names are rejected at
//! parse time (`deny_unknown_fields`) and out-of-range values by
//! [`GenerationConfig::validate`], both before anything is sent to the remote
//! stream.

use serde::{Deserialize, Serialize};

use crate::error::{CadenzaError, Result};

/// One text prompt and its relative influence on generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedPrompt {
    pub text: String,
    /// Relative weight, typically in [-5, 5].
    pub weight: f32,
}

impl WeightedPrompt {
    pub fn new(text: impl Into<String>, weight: f32) -> Self {
        Self {
            text: text.into(),
            weight,
        }
    }
}

/// Generation mode trade-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationMode {
    Quality,
    Diversity,
    Vocalization,
}

/// Musical scale, named by its relative major/minor pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scale {
    ScaleUnspecified,
    CMajorAMinor,
    DFlatMajorBFlatMinor,
    DMajorBMinor,
    EFlatMajorCMinor,
    EMajorDFlatMinor,
    FMajorDMinor,
    GFlatMajorEFlatMinor,
    GMajorEMinor,
    AFlatMajorFMinor,
    AMajorGFlatMinor,
    BFlatMajorGMinor,
    BMajorAFlatMinor,
}

impl Scale {
    pub const ALL: [Scale; 13] = [
        Scale::ScaleUnspecified,
        Scale::CMajorAMinor,
        Scale::DFlatMajorBFlatMinor,
        Scale::DMajorBMinor,
        Scale::EFlatMajorCMinor,
        Scale::EMajorDFlatMinor,
        Scale::FMajorDMinor,
        Scale::GFlatMajorEFlatMinor,
        Scale::GMajorEMinor,
        Scale::AFlatMajorFMinor,
        Scale::AMajorGFlatMinor,
        Scale::BFlatMajorGMinor,
        Scale::BMajorAFlatMinor,
    ];

    /// Semitones of the major tonic above C, or `None` when unspecified.
    pub fn tonic_semitone(self) -> Option<u8> {
        Scale::ALL
            .iter()
            .position(|s| *s == self)
            .and_then(|idx| idx.checked_sub(1))
            .map(|idx| idx as u8)
    }

    /// Parse the wire name (e.g. `C_MAJOR_A_MINOR`).
    pub fn from_name(name: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(name.trim().to_ascii_uppercase()))
            .map_err(|_| CadenzaError::InvalidConfig(format!("unknown scale: {name}")))
    }
}

impl GenerationMode {
    pub fn from_name(name: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(name.trim().to_ascii_uppercase()))
            .map_err(|_| CadenzaError::InvalidConfig(format!("unknown generation mode: {name}")))
    }
}

/// Musical generation parameters. Unset fields are left to the service default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bpm: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub density: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mute_bass: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mute_drums: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_bass_and_drums: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub music_generation_mode: Option<GenerationMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<Scale>,
}

impl GenerationConfig {
    /// Build from a loose option map, rejecting any unrecognised option.
    pub fn from_options(options: serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        let config: Self = serde_json::from_value(serde_json::Value::Object(options))
            .map_err(|e| CadenzaError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| CadenzaError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Range-check every set field.
    pub fn validate(&self) -> Result<()> {
        if let Some(bpm) = self.bpm {
            check_range("bpm", bpm as f32, 60.0, 200.0)?;
        }
        if let Some(density) = self.density {
            check_range("density", density, 0.0, 1.0)?;
        }
        if let Some(brightness) = self.brightness {
            check_range("brightness", brightness, 0.0, 1.0)?;
        }
        if let Some(guidance) = self.guidance {
            check_range("guidance", guidance, 0.0, 6.0)?;
        }
        if let Some(temperature) = self.temperature {
            check_range("temperature", temperature, 0.0, 3.0)?;
        }
        if let Some(top_k) = self.top_k {
            check_range("top_k", top_k as f32, 1.0, 1000.0)?;
        }
        Ok(())
    }
}

fn check_range(name: &str, value: f32, min: f32, max: f32) -> Result<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(CadenzaError::InvalidConfig(format!(
            "{name} = {value} outside [{min}, {max}]"
        )));
    }
    Ok(())
}
