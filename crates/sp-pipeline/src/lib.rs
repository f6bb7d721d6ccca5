#![forbid(unsafe_code)]

//! A minimal language pipeline: tokenizer plus named components.
//!
//! The only component factory is `"textcat"`. A [`TextCategorizer`] collects
//! labels first; its model is built and initialised by
//! [`Language::begin_training`], once the number of labels is known.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sp_core::Array;
use sp_models::{
    BowConfig, ConfigError, TextClassifierConfig, Tok2VecConfig, build_bow_text_classifier,
    build_simple_cnn_text_classifier, build_text_classifier, build_tok2vec_model,
};
use sp_nn::{Model, NnError, Value, set_dropout_rate};
use sp_optim::{Adam, AdamConfig, Optimizer};
use sp_random::RandomState;
use sp_text::{Doc, Tokenizer};

pub const TEXTCAT_FACTORY: &str = "textcat";

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    UnknownFactory { name: String },
    DuplicatePipe { name: String },
    MissingPipe { name: String },
    NoLabels { pipe: String },
    LabelsFrozen { pipe: String },
    NotInitialized { pipe: String },
    ConfigParse { component: String, message: String },
    UnexpectedOutput { pipe: String, kind: &'static str },
    Config(ConfigError),
    Model(NnError),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFactory { name } => write!(f, "no component factory named '{name}'"),
            Self::DuplicatePipe { name } => write!(f, "pipeline already has a '{name}' component"),
            Self::MissingPipe { name } => write!(f, "pipeline has no '{name}' component"),
            Self::NoLabels { pipe } => write!(f, "component '{pipe}' has no labels"),
            Self::LabelsFrozen { pipe } => {
                write!(f, "component '{pipe}' is initialized; labels can no longer change")
            }
            Self::NotInitialized { pipe } => {
                write!(f, "component '{pipe}' used before begin_training()")
            }
            Self::ConfigParse { component, message } => {
                write!(f, "invalid config for '{component}': {message}")
            }
            Self::UnexpectedOutput { pipe, kind } => {
                write!(f, "component '{pipe}' model produced {kind}, expected scores")
            }
            Self::Config(error) => write!(f, "{error}"),
            Self::Model(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<ConfigError> for PipelineError {
    fn from(error: ConfigError) -> Self {
        Self::Config(error)
    }
}

impl From<NnError> for PipelineError {
    fn from(error: NnError) -> Self {
        Self::Model(error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    #[default]
    Ensemble,
    SimpleCnn,
    Bow,
}

/// Component config; the same shape is accepted by `create_pipe` and by the
/// `component_cfg` map of `begin_training`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TextcatConfig {
    pub exclusive_classes: bool,
    pub architecture: Architecture,
    pub width: usize,
    pub embed_size: usize,
    pub ngram_size: usize,
    pub window_size: usize,
    pub conv_depth: usize,
    pub dropout: Option<f64>,
}

impl Default for TextcatConfig {
    fn default() -> Self {
        Self {
            exclusive_classes: false,
            architecture: Architecture::Ensemble,
            width: 64,
            embed_size: 2000,
            ngram_size: 1,
            window_size: 1,
            conv_depth: 2,
            dropout: None,
        }
    }
}

impl TextcatConfig {
    pub fn from_json(component: &str, value: &serde_json::Value) -> Result<Self, PipelineError> {
        serde_json::from_value(value.clone()).map_err(|error| PipelineError::ConfigParse {
            component: component.to_string(),
            message: error.to_string(),
        })
    }

    fn build_model(&self, n_o: usize) -> Result<Model, ConfigError> {
        match self.architecture {
            Architecture::Ensemble => build_text_classifier(&TextClassifierConfig {
                width: self.width,
                embed_size: self.embed_size,
                pretrained_vectors: None,
                exclusive_classes: self.exclusive_classes,
                ngram_size: self.ngram_size,
                window_size: self.window_size,
                conv_depth: self.conv_depth,
                dropout: self.dropout,
                n_o,
            }),
            Architecture::SimpleCnn => {
                let tok2vec = build_tok2vec_model(&Tok2VecConfig {
                    width: self.width,
                    embed_size: self.embed_size,
                    window_size: self.window_size,
                    conv_depth: self.conv_depth,
                    dropout: self.dropout,
                    ..Tok2VecConfig::default()
                })?;
                build_simple_cnn_text_classifier(tok2vec, self.exclusive_classes, n_o)
            }
            Architecture::Bow => build_bow_text_classifier(&BowConfig {
                exclusive_classes: self.exclusive_classes,
                ngram_size: self.ngram_size,
                n_o,
            }),
        }
    }
}

/// Document classifier writing one score per label into `Doc::cats`.
#[derive(Debug, Clone)]
pub struct TextCategorizer {
    name: String,
    cfg: TextcatConfig,
    labels: Vec<String>,
    model: Option<Model>,
}

impl TextCategorizer {
    #[must_use]
    pub fn new(name: impl Into<String>, cfg: TextcatConfig) -> Self {
        Self {
            name: name.into(),
            cfg,
            labels: Vec::new(),
            model: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn cfg(&self) -> &TextcatConfig {
        &self.cfg
    }

    /// Labels in insertion order; score column `i` belongs to `labels()[i]`.
    #[must_use]
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Returns `false` if the label was already present.
    pub fn add_label(&mut self, label: impl Into<String>) -> Result<bool, PipelineError> {
        let label = label.into();
        if self.labels.contains(&label) {
            return Ok(false);
        }
        if self.model.is_some() {
            return Err(PipelineError::LabelsFrozen {
                pipe: self.name.clone(),
            });
        }
        self.labels.push(label);
        Ok(true)
    }

    pub fn model(&self) -> Result<&Model, PipelineError> {
        self.model.as_ref().ok_or_else(|| PipelineError::NotInitialized {
            pipe: self.name.clone(),
        })
    }

    pub fn model_mut(&mut self) -> Result<&mut Model, PipelineError> {
        let pipe = self.name.clone();
        self.model
            .as_mut()
            .ok_or(PipelineError::NotInitialized { pipe })
    }

    /// Build the model for the current label set and draw its parameters.
    pub fn begin_training(&mut self, rng: &mut RandomState) -> Result<(), PipelineError> {
        if self.labels.is_empty() {
            return Err(PipelineError::NoLabels {
                pipe: self.name.clone(),
            });
        }
        let mut model = self.cfg.build_model(self.labels.len())?;
        model.initialize(rng)?;
        self.model = Some(model);
        Ok(())
    }

    /// Scores of shape `[docs, labels]`.
    pub fn predict(&self, docs: &[Doc]) -> Result<Array, PipelineError> {
        let output = self.model()?.predict(Value::Docs(docs.to_vec()))?;
        self.expect_scores(output)
    }

    pub fn set_annotations(&self, docs: &mut [Doc], scores: &Array) {
        for (row, doc) in docs.iter_mut().enumerate() {
            for (label, score) in self.labels.iter().zip(scores.row(row)) {
                doc.cats.insert(label.clone(), *score);
            }
        }
    }

    /// `d_scores = scores - truths`, zero where a doc has no value for a
    /// label. Returns `(sum of squared d_scores, d_scores)`.
    #[must_use]
    pub fn get_loss(&self, docs: &[Doc], scores: &Array) -> (f64, Array) {
        let mut d_scores = Array::zeros(scores.shape().to_vec());
        for (row, doc) in docs.iter().enumerate() {
            let predicted = scores.row(row);
            let target = d_scores.row_mut(row);
            for (column, label) in self.labels.iter().enumerate() {
                if let Some(truth) = doc.cats.get(label) {
                    target[column] = predicted[column] - truth;
                }
            }
        }
        let loss = d_scores.as_slice().iter().map(|d| d * d).sum();
        (loss, d_scores)
    }

    /// One training step on docs whose `cats` hold the gold scores.
    pub fn update(
        &mut self,
        rng: &mut RandomState,
        docs: &[Doc],
        drop: f64,
        optimizer: &mut dyn Optimizer,
    ) -> Result<f64, PipelineError> {
        let model = self.model_mut()?;
        set_dropout_rate(model, drop)?;
        let (output, backprop) = model.begin_update(rng, Value::Docs(docs.to_vec()))?;
        let scores = self.expect_scores(output)?;
        let (loss, d_scores) = self.get_loss(docs, &scores);
        let model = self.model_mut()?;
        backprop.backward(model, Value::Array(d_scores))?;
        model.finish_update(optimizer)?;
        Ok(loss)
    }

    fn expect_scores(&self, output: Value) -> Result<Array, PipelineError> {
        match output {
            Value::Array(scores) => Ok(scores),
            other => Err(PipelineError::UnexpectedOutput {
                pipe: self.name.clone(),
                kind: other.kind(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipePosition {
    #[default]
    Last,
    First,
}

#[derive(Debug, Clone)]
pub struct Language {
    code: &'static str,
    tokenizer: Tokenizer,
    components: Vec<TextCategorizer>,
}

impl Language {
    #[must_use]
    pub fn english() -> Self {
        Self {
            code: "en",
            tokenizer: Tokenizer::new(),
            components: Vec::new(),
        }
    }

    #[must_use]
    pub fn code(&self) -> &str {
        self.code
    }

    /// Tokenize only; no components run.
    #[must_use]
    pub fn make_doc(&self, text: &str) -> Doc {
        self.tokenizer.tokenize(text)
    }

    /// Tokenize each text and run every component over the batch.
    pub fn pipe<I, S>(&self, texts: I) -> Result<Vec<Doc>, PipelineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut docs: Vec<Doc> = texts
            .into_iter()
            .map(|text| self.make_doc(text.as_ref()))
            .collect();
        for component in &self.components {
            let scores = component.predict(&docs)?;
            component.set_annotations(&mut docs, &scores);
        }
        Ok(docs)
    }

    pub fn process(&self, text: &str) -> Result<Doc, PipelineError> {
        let mut docs = self.pipe([text])?;
        docs.pop().ok_or_else(|| PipelineError::MissingPipe {
            name: "tokenizer".to_string(),
        })
    }

    /// `config` is a JSON object in [`TextcatConfig`] shape; `None` keeps the
    /// defaults.
    pub fn create_pipe(
        &self,
        factory: &str,
        config: Option<&serde_json::Value>,
    ) -> Result<TextCategorizer, PipelineError> {
        if factory != TEXTCAT_FACTORY {
            return Err(PipelineError::UnknownFactory {
                name: factory.to_string(),
            });
        }
        let cfg = match config {
            Some(value) => TextcatConfig::from_json(factory, value)?,
            None => TextcatConfig::default(),
        };
        Ok(TextCategorizer::new(factory, cfg))
    }

    pub fn add_pipe(
        &mut self,
        component: TextCategorizer,
        position: PipePosition,
    ) -> Result<(), PipelineError> {
        if self.has_pipe(component.name()) {
            return Err(PipelineError::DuplicatePipe {
                name: component.name().to_string(),
            });
        }
        match position {
            PipePosition::Last => self.components.push(component),
            PipePosition::First => self.components.insert(0, component),
        }
        Ok(())
    }

    #[must_use]
    pub fn has_pipe(&self, name: &str) -> bool {
        self.components.iter().any(|component| component.name() == name)
    }

    #[must_use]
    pub fn pipe_names(&self) -> Vec<&str> {
        self.components.iter().map(TextCategorizer::name).collect()
    }

    pub fn get_pipe(&mut self, name: &str) -> Result<&mut TextCategorizer, PipelineError> {
        self.components
            .iter_mut()
            .find(|component| component.name() == name)
            .ok_or_else(|| PipelineError::MissingPipe {
                name: name.to_string(),
            })
    }

    pub fn remove_pipe(&mut self, name: &str) -> Result<TextCategorizer, PipelineError> {
        let index = self
            .components
            .iter()
            .position(|component| component.name() == name)
            .ok_or_else(|| PipelineError::MissingPipe {
                name: name.to_string(),
            })?;
        Ok(self.components.remove(index))
    }

    /// Apply per-component config overrides, build and initialise every
    /// component's model in pipeline order, and return a fresh optimizer.
    pub fn begin_training(
        &mut self,
        rng: &mut RandomState,
        component_cfg: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Adam, PipelineError> {
        self.begin_training_with(rng, component_cfg, &AdamConfig::default())
    }

    pub fn begin_training_with(
        &mut self,
        rng: &mut RandomState,
        component_cfg: &BTreeMap<String, serde_json::Value>,
        optimizer: &AdamConfig,
    ) -> Result<Adam, PipelineError> {
        for name in component_cfg.keys() {
            if !self.has_pipe(name) {
                return Err(PipelineError::MissingPipe { name: name.clone() });
            }
        }
        for component in &mut self.components {
            if let Some(value) = component_cfg.get(component.name()) {
                component.cfg = TextcatConfig::from_json(component.name(), value)?;
            }
            component.begin_training(rng)?;
        }
        Ok(optimizer.build())
    }

    /// Train every component on `(text, gold cats)` examples. Returns the
    /// loss per component.
    pub fn update(
        &mut self,
        rng: &mut RandomState,
        examples: &[(String, BTreeMap<String, f64>)],
        drop: f64,
        optimizer: &mut dyn Optimizer,
    ) -> Result<BTreeMap<String, f64>, PipelineError> {
        let docs: Vec<Doc> = examples
            .iter()
            .map(|(text, cats)| {
                let mut doc = self.make_doc(text);
                doc.cats = cats.clone();
                doc
            })
            .collect();
        let mut losses = BTreeMap::new();
        for component in &mut self.components {
            let loss = component.update(rng, &docs, drop, optimizer)?;
            losses.insert(component.name().to_string(), loss);
        }
        Ok(losses)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use sp_random::RandomState;

    use super::*;

    const TEXT: &str = "Once hot, form ping-pong-ball-sized balls of the mixture, each weighing roughly 25 g.";

    fn small_cfg() -> serde_json::Value {
        json!({ "exclusive_classes": false, "width": 8, "embed_size": 50, "conv_depth": 1 })
    }

    fn gold() -> BTreeMap<String, f64> {
        [("Labe1", 1.0), ("Label2", 0.0), ("Label3", 0.0)]
            .into_iter()
            .map(|(label, score)| (label.to_string(), score))
            .collect()
    }

    fn trained_nlp(seed: u64) -> (Language, Adam) {
        let mut rng = RandomState::seeded(seed);
        let mut nlp = Language::english();
        let pipe = nlp
            .create_pipe(TEXTCAT_FACTORY, Some(&small_cfg()))
            .expect("create textcat");
        nlp.add_pipe(pipe, PipePosition::Last).expect("add textcat");
        let textcat = nlp.get_pipe(TEXTCAT_FACTORY).expect("get textcat");
        for label in gold().keys() {
            textcat.add_label(label.clone()).expect("add label");
        }
        let component_cfg = BTreeMap::from([(TEXTCAT_FACTORY.to_string(), small_cfg())]);
        let optimizer = nlp
            .begin_training(&mut rng, &component_cfg)
            .expect("begin training");
        (nlp, optimizer)
    }

    #[test]
    fn make_doc_tokenizes_without_components() {
        let nlp = Language::english();
        let doc = nlp.make_doc(TEXT);
        assert_eq!(doc.tokens()[0].text(), "Once");
        assert_eq!(doc.tokens()[1].text(), "hot");
        assert_eq!(nlp.code(), "en");
        let docs = nlp.pipe(["a b", "c"]).expect("pipe without components");
        assert_eq!(docs.len(), 2);
        assert!(docs[0].cats.is_empty());
    }

    #[test]
    fn textcat_scores_every_label() {
        let (nlp, _) = trained_nlp(0);
        let doc = nlp.process(TEXT).expect("process");
        let labels: Vec<&String> = doc.cats.keys().collect();
        assert_eq!(labels, vec!["Labe1", "Label2", "Label3"]);
        assert!(doc.cats.values().all(|p| *p > 0.0 && *p < 1.0));
    }

    #[test]
    fn seeded_pipe_training_is_reproducible() {
        let run = |seed: u64| {
            let (mut nlp, mut optimizer) = trained_nlp(seed);
            let mut rng = RandomState::seeded(seed);
            let losses = nlp
                .update(&mut rng, &[(TEXT.to_string(), gold())], 0.2, &mut optimizer)
                .expect("update");
            let textcat = nlp.get_pipe(TEXTCAT_FACTORY).expect("textcat");
            let scores = textcat
                .predict(&[Language::english().make_doc(TEXT)])
                .expect("predict");
            (losses, scores)
        };
        let (loss_a, scores_a) = run(0);
        let (loss_b, scores_b) = run(0);
        assert_eq!(loss_a, loss_b);
        assert_eq!(scores_a, scores_b);
        assert!(loss_a[TEXTCAT_FACTORY] > 0.0);
    }

    #[test]
    fn update_moves_scores_toward_gold() {
        let (mut nlp, mut optimizer) = trained_nlp(4);
        optimizer.set_lr(0.01);
        let doc = Language::english().make_doc(TEXT);
        let before = nlp
            .get_pipe(TEXTCAT_FACTORY)
            .expect("textcat")
            .predict(std::slice::from_ref(&doc))
            .expect("predict");
        let mut rng = RandomState::seeded(4);
        for _ in 0..10 {
            nlp.update(&mut rng, &[(TEXT.to_string(), gold())], 0.0, &mut optimizer)
                .expect("update");
        }
        let after = nlp
            .get_pipe(TEXTCAT_FACTORY)
            .expect("textcat")
            .predict(std::slice::from_ref(&doc))
            .expect("predict");
        assert!(after.row(0)[0] > before.row(0)[0]);
        assert!(after.row(0)[1] < before.row(0)[1]);
    }

    #[test]
    fn pipeline_errors_are_reported() {
        let mut nlp = Language::english();
        assert_eq!(
            nlp.create_pipe("ner", None).map(|_| ()),
            Err(PipelineError::UnknownFactory {
                name: "ner".to_string()
            })
        );
        assert!(matches!(
            nlp.create_pipe(TEXTCAT_FACTORY, Some(&json!({ "bogus": 1 }))),
            Err(PipelineError::ConfigParse { .. })
        ));
        let pipe = nlp.create_pipe(TEXTCAT_FACTORY, None).expect("create");
        nlp.add_pipe(pipe.clone(), PipePosition::First).expect("add");
        assert!(matches!(
            nlp.add_pipe(pipe, PipePosition::Last),
            Err(PipelineError::DuplicatePipe { .. })
        ));
        assert!(matches!(
            nlp.begin_training(&mut RandomState::seeded(0), &BTreeMap::new()),
            Err(PipelineError::NoLabels { .. })
        ));
        assert!(matches!(
            nlp.pipe(["text"]),
            Err(PipelineError::NotInitialized { .. })
        ));
        assert!(matches!(
            nlp.get_pipe("parser"),
            Err(PipelineError::MissingPipe { .. })
        ));
        assert_eq!(nlp.pipe_names(), vec![TEXTCAT_FACTORY]);
        nlp.remove_pipe(TEXTCAT_FACTORY).expect("remove");
        assert!(nlp.pipe_names().is_empty());
    }

    #[test]
    fn labels_freeze_after_training() {
        let (mut nlp, _) = trained_nlp(1);
        let textcat = nlp.get_pipe(TEXTCAT_FACTORY).expect("textcat");
        assert_eq!(textcat.add_label("Labe1"), Ok(false));
        assert!(matches!(
            textcat.add_label("Label4"),
            Err(PipelineError::LabelsFrozen { .. })
        ));
    }

    #[test]
    fn architectures_produce_label_scores() {
        for architecture in ["ensemble", "simple_cnn", "bow"] {
            let mut nlp = Language::english();
            let cfg = json!({
                "architecture": architecture,
                "exclusive_classes": true,
                "width": 8,
                "embed_size": 50,
                "conv_depth": 1,
            });
            let pipe = nlp.create_pipe(TEXTCAT_FACTORY, Some(&cfg)).expect("create");
            nlp.add_pipe(pipe, PipePosition::Last).expect("add");
            let textcat = nlp.get_pipe(TEXTCAT_FACTORY).expect("get");
            textcat.add_label("A").expect("label");
            textcat.add_label("B").expect("label");
            nlp.begin_training(&mut RandomState::seeded(2), &BTreeMap::new())
                .expect("begin training");
            let doc = nlp.process(TEXT).expect("process");
            let total: f64 = doc.cats.values().sum();
            assert!((total - 1.0).abs() < 1e-9, "{architecture}: {total}");
        }
    }
}
