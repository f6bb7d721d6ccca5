//! Named-config construction of the four text model kinds.

use serde::{Deserialize, Serialize};
use sp_models::{
    BowConfig, SimpleCnnConfig, TextClassifierConfig, Tok2VecConfig, build_bow_text_classifier,
    build_simple_cnn_text_classifier, build_text_classifier, build_tok2vec_model,
};
use sp_nn::Model;
use sp_random::RandomState;

use crate::HarnessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[serde(rename = "tok2vec")]
    Tok2Vec,
    TextClassifier,
    SimpleCnnTextClassifier,
    BowTextClassifier,
}

impl ModelKind {
    pub const ALL: [Self; 4] = [
        Self::Tok2Vec,
        Self::TextClassifier,
        Self::SimpleCnnTextClassifier,
        Self::BowTextClassifier,
    ];

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Tok2Vec => "tok2vec",
            Self::TextClassifier => "text_classifier",
            Self::SimpleCnnTextClassifier => "simple_cnn_text_classifier",
            Self::BowTextClassifier => "bow_text_classifier",
        }
    }
}

/// Keyword configuration for one model kind, tagged by `"kind"` in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelConfig {
    #[serde(rename = "tok2vec")]
    Tok2Vec(Tok2VecConfig),
    TextClassifier(TextClassifierConfig),
    SimpleCnnTextClassifier(SimpleCnnConfig),
    BowTextClassifier(BowConfig),
}

impl ModelConfig {
    #[must_use]
    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Tok2Vec(_) => ModelKind::Tok2Vec,
            Self::TextClassifier(_) => ModelKind::TextClassifier,
            Self::SimpleCnnTextClassifier(_) => ModelKind::SimpleCnnTextClassifier,
            Self::BowTextClassifier(_) => ModelKind::BowTextClassifier,
        }
    }

    /// Defaults for `kind`.
    #[must_use]
    pub fn default_for(kind: ModelKind) -> Self {
        match kind {
            ModelKind::Tok2Vec => Self::Tok2Vec(Tok2VecConfig::default()),
            ModelKind::TextClassifier => Self::TextClassifier(TextClassifierConfig::default()),
            ModelKind::SimpleCnnTextClassifier => {
                Self::SimpleCnnTextClassifier(SimpleCnnConfig::default())
            }
            ModelKind::BowTextClassifier => Self::BowTextClassifier(BowConfig::default()),
        }
    }
}

/// Build an uninitialised model. The simple CNN classifier receives a
/// freshly built tok2vec encoder by value.
pub fn build(config: &ModelConfig) -> Result<Model, HarnessError> {
    let model = match config {
        ModelConfig::Tok2Vec(cfg) => build_tok2vec_model(cfg)?,
        ModelConfig::TextClassifier(cfg) => build_text_classifier(cfg)?,
        ModelConfig::SimpleCnnTextClassifier(cfg) => {
            let tok2vec = build_tok2vec_model(&cfg.tok2vec)?;
            build_simple_cnn_text_classifier(tok2vec, cfg.exclusive_classes, cfg.n_o)?
        }
        ModelConfig::BowTextClassifier(cfg) => build_bow_text_classifier(cfg)?,
    };
    Ok(model)
}

/// Build from a bare JSON object of keyword arguments for `kind`. Unknown
/// keys are rejected.
pub fn build_from_json(kind: ModelKind, kwargs: &serde_json::Value) -> Result<Model, HarnessError> {
    build(&config_from_json(kind, kwargs)?)
}

pub fn config_from_json(
    kind: ModelKind,
    kwargs: &serde_json::Value,
) -> Result<ModelConfig, HarnessError> {
    let parse_error = |error: serde_json::Error| HarnessError::ConfigParse {
        kind: kind.label(),
        message: error.to_string(),
    };
    let kwargs = kwargs.clone();
    let config = match kind {
        ModelKind::Tok2Vec => ModelConfig::Tok2Vec(serde_json::from_value(kwargs).map_err(parse_error)?),
        ModelKind::TextClassifier => {
            ModelConfig::TextClassifier(serde_json::from_value(kwargs).map_err(parse_error)?)
        }
        ModelKind::SimpleCnnTextClassifier => {
            ModelConfig::SimpleCnnTextClassifier(serde_json::from_value(kwargs).map_err(parse_error)?)
        }
        ModelKind::BowTextClassifier => {
            ModelConfig::BowTextClassifier(serde_json::from_value(kwargs).map_err(parse_error)?)
        }
    };
    Ok(config)
}

/// `build` followed by `initialize`.
pub fn build_initialized(config: &ModelConfig, rng: &mut RandomState) -> Result<Model, HarnessError> {
    let mut model = build(config)?;
    model.initialize(rng)?;
    Ok(model)
}
