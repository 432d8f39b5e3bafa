//! Representation conversion rules.
//!
//! Rules are directed: a georeferenced raster can be turned back into a raw
//! sample, but a rendered image is a terminal representation.

use crate::error::PlanError;
use crate::models::{ImageStyle, Representation};
use serde::{Deserialize, Serialize};

/// One conversion step appended after a stage producing a representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStage {
    /// raw sample -> grayscale image
    Render { normalize: bool },
    /// raw sample -> georeferenced raster
    ExportGeoreferenced,
    /// georeferenced raster -> hillshaded image
    HillshadeRender,
    /// georeferenced raster -> raw sample
    ImportRawSample,
}

impl ConversionStage {
    /// Stable identifier used in run-once fingerprints.
    pub fn operation_id(&self) -> &'static str {
        match self {
            ConversionStage::Render { normalize: false } => "convert.render",
            ConversionStage::Render { normalize: true } => "convert.render_normalized",
            ConversionStage::ExportGeoreferenced => "convert.export_georeferenced",
            ConversionStage::HillshadeRender => "convert.hillshade_render",
            ConversionStage::ImportRawSample => "convert.import_raw_sample",
        }
    }

    /// Representation produced by this stage.
    pub fn output(&self) -> Representation {
        match self {
            ConversionStage::Render { normalize: false } => Representation::Image(ImageStyle::Plain),
            ConversionStage::Render { normalize: true } => {
                Representation::Image(ImageStyle::Normalized)
            }
            ConversionStage::ExportGeoreferenced => Representation::GeoRaster,
            ConversionStage::HillshadeRender => Representation::Image(ImageStyle::Hillshade),
            ConversionStage::ImportRawSample => Representation::RawSample,
        }
    }
}

fn from_raw_sample(to: Representation) -> Vec<ConversionStage> {
    match to {
        Representation::RawSample => Vec::new(),
        Representation::Image(ImageStyle::Plain) => vec![ConversionStage::Render { normalize: false }],
        Representation::Image(ImageStyle::Normalized) => {
            vec![ConversionStage::Render { normalize: true }]
        }
        Representation::GeoRaster => vec![ConversionStage::ExportGeoreferenced],
        Representation::Image(ImageStyle::Hillshade) => vec![
            ConversionStage::ExportGeoreferenced,
            ConversionStage::HillshadeRender,
        ],
    }
}

/// Ordered stages converting `from` into `to`.
///
/// Pairs without a rule are configuration errors; they are never treated as
/// identity.
pub fn conversion_stages(
    from: Representation,
    to: Representation,
) -> Result<Vec<ConversionStage>, PlanError> {
    match from {
        Representation::RawSample => Ok(from_raw_sample(to)),
        Representation::GeoRaster => match to {
            Representation::GeoRaster => Ok(Vec::new()),
            Representation::Image(ImageStyle::Hillshade) => Ok(vec![ConversionStage::HillshadeRender]),
            _ => {
                let mut stages = vec![ConversionStage::ImportRawSample];
                stages.extend(from_raw_sample(to));
                Ok(stages)
            }
        },
        Representation::Image(_) => Err(PlanError::config(format!(
            "no conversion from '{}' to '{}'",
            from, to
        ))),
    }
}
