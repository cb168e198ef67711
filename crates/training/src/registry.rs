use candle_core::Device;

use crate::{
    config::{LossSection, ModelSection},
    loss::SpacedCrossEntropy,
    model::{LineCrnn, Recognizer},
    TrainingError,
};

const MODEL_TAGS: &[&str] = &["line_crnn"];
const LOSS_TAGS: &[&str] = &["spaced_cross_entropy"];

/// Resolves the configured model tag to a constructed recognizer. Tags are
/// matched exactly; an unknown tag is a startup failure, never a silent
/// fallback.
pub fn build_model(
    section: &ModelSection,
    classes: usize,
    device: &Device,
) -> Result<Box<dyn Recognizer>, TrainingError> {
    match section.tag.as_str() {
        "line_crnn" => Ok(Box::new(LineCrnn::new(
            classes,
            section.hidden_size,
            device,
        )?)),
        other => Err(TrainingError::initialization(format!(
            "unknown model tag '{}' (known: {})",
            other,
            MODEL_TAGS.join(", ")
        ))),
    }
}

pub fn build_loss(section: &LossSection) -> Result<SpacedCrossEntropy, TrainingError> {
    match section.tag.as_str() {
        "spaced_cross_entropy" => Ok(SpacedCrossEntropy::new()),
        other => Err(TrainingError::initialization(format!(
            "unknown loss tag '{}' (known: {})",
            other,
            LOSS_TAGS.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tags_are_fatal() {
        let model = ModelSection {
            tag: "transformer_xxl".to_string(),
            hidden_size: 64,
        };
        assert!(build_model(&model, 30, &Device::Cpu).is_err());

        let loss = LossSection {
            tag: "ctc".to_string(),
        };
        assert!(build_loss(&loss).is_err());
    }

    #[test]
    fn known_tags_resolve() {
        let model = ModelSection::default();
        assert!(build_model(&model, 30, &Device::Cpu).is_ok());
        let loss = LossSection::default();
        assert!(build_loss(&loss).is_ok());
    }
}
