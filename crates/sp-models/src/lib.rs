#![forbid(unsafe_code)]

//! Builders for the text models the harness exercises.
//!
//! Each builder validates a serde config and returns an uninitialised
//! [`Model`]; parameters only exist after [`Model::initialize`]. Every block
//! carries a dropout node (rate 0 unless configured) so
//! [`sp_nn::set_dropout_rate`] always has something to act on.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sp_core::det64_str;
use sp_nn::{
    DIM_OUT, Model, NnError, VectorTable, chain, concatenate, dropout, expand_window,
    extract_ngrams, feature_extractor, hash_embed, layer_norm, linear, logistic, maxout,
    reduce_mean, residual, softmax, softmax_activation, sparse_linear, static_vectors,
};
use sp_text::Attr;

/// Hashed weight rows per class in the bag-of-words layer.
pub const BOW_FEATURE_LENGTH: usize = 1 << 16;

const EMBED_PIECES: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    ZeroDim { field: &'static str },
    ZeroClasses,
    CharEmbedUnsupported,
    BilstmUnsupported { depth: usize },
    InvalidDropout { rate: f64 },
    CharDimsWithoutCharEmbed { n_m: usize, n_c: usize },
    VectorWidth {
        word: String,
        expected: usize,
        actual: usize,
    },
    Model(NnError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroDim { field } => write!(f, "{field} must be > 0"),
            Self::ZeroClasses => write!(f, "n_o (number of classes) must be > 0"),
            Self::CharEmbedUnsupported => write!(f, "char_embed is not supported"),
            Self::BilstmUnsupported { depth } => {
                write!(f, "bilstm_depth={depth} is not supported; use 0")
            }
            Self::InvalidDropout { rate } => {
                write!(f, "dropout must be finite and in [0, 1), got {rate}")
            }
            Self::CharDimsWithoutCharEmbed { n_m, n_c } => write!(
                f,
                "n_m={n_m} / n_c={n_c} only apply to character embeddings"
            ),
            Self::VectorWidth {
                word,
                expected,
                actual,
            } => write!(
                f,
                "pretrained vector for '{word}' has width {actual}, expected {expected}"
            ),
            Self::Model(error) => write!(f, "model construction failed: {error}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<NnError> for ConfigError {
    fn from(error: NnError) -> Self {
        Self::Model(error)
    }
}

/// Inline pretrained vectors keyed by token text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PretrainedVectors {
    pub width: usize,
    #[serde(default)]
    pub vectors: BTreeMap<String, Vec<f64>>,
}

impl PretrainedVectors {
    pub fn to_table(&self) -> Result<VectorTable, ConfigError> {
        if self.width == 0 {
            return Err(ConfigError::ZeroDim {
                field: "pretrained_vectors.width",
            });
        }
        let mut entries = Vec::with_capacity(self.vectors.len());
        for (word, vector) in &self.vectors {
            if vector.len() != self.width {
                return Err(ConfigError::VectorWidth {
                    word: word.clone(),
                    expected: self.width,
                    actual: vector.len(),
                });
            }
            entries.push((det64_str(word), vector.clone()));
        }
        Ok(VectorTable::from_entries(self.width, entries)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Tok2VecConfig {
    pub width: usize,
    pub embed_size: usize,
    pub subword_features: bool,
    pub char_embed: bool,
    pub conv_depth: usize,
    pub bilstm_depth: usize,
    pub maxout_pieces: usize,
    pub window_size: usize,
    pub dropout: Option<f64>,
    pub n_m: usize,
    pub n_c: usize,
    pub pretrained_vectors: Option<PretrainedVectors>,
}

impl Default for Tok2VecConfig {
    fn default() -> Self {
        Self {
            width: 96,
            embed_size: 2000,
            subword_features: true,
            char_embed: false,
            conv_depth: 4,
            bilstm_depth: 0,
            maxout_pieces: 4,
            window_size: 1,
            dropout: Some(0.1),
            n_m: 0,
            n_c: 0,
            pretrained_vectors: None,
        }
    }
}

impl Tok2VecConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.char_embed {
            return Err(ConfigError::CharEmbedUnsupported);
        }
        if self.n_m != 0 || self.n_c != 0 {
            return Err(ConfigError::CharDimsWithoutCharEmbed {
                n_m: self.n_m,
                n_c: self.n_c,
            });
        }
        if self.bilstm_depth != 0 {
            return Err(ConfigError::BilstmUnsupported {
                depth: self.bilstm_depth,
            });
        }
        require_positive("width", self.width)?;
        require_positive("embed_size", self.embed_size)?;
        require_positive("maxout_pieces", self.maxout_pieces)?;
        dropout_rate(self.dropout)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TextClassifierConfig {
    pub width: usize,
    pub embed_size: usize,
    pub pretrained_vectors: Option<PretrainedVectors>,
    pub exclusive_classes: bool,
    pub ngram_size: usize,
    pub window_size: usize,
    pub conv_depth: usize,
    pub dropout: Option<f64>,
    pub n_o: usize,
}

impl Default for TextClassifierConfig {
    fn default() -> Self {
        Self {
            width: 64,
            embed_size: 2000,
            pretrained_vectors: None,
            exclusive_classes: false,
            ngram_size: 1,
            window_size: 1,
            conv_depth: 2,
            dropout: None,
            n_o: 7,
        }
    }
}

impl TextClassifierConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("width", self.width)?;
        require_positive("embed_size", self.embed_size)?;
        require_positive("ngram_size", self.ngram_size)?;
        require_classes(self.n_o)?;
        dropout_rate(self.dropout)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SimpleCnnConfig {
    pub tok2vec: Tok2VecConfig,
    pub exclusive_classes: bool,
    pub n_o: usize,
}

impl Default for SimpleCnnConfig {
    fn default() -> Self {
        Self {
            tok2vec: Tok2VecConfig::default(),
            exclusive_classes: false,
            n_o: 13,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BowConfig {
    pub exclusive_classes: bool,
    pub ngram_size: usize,
    pub n_o: usize,
}

impl Default for BowConfig {
    fn default() -> Self {
        Self {
            exclusive_classes: false,
            ngram_size: 1,
            n_o: 7,
        }
    }
}

impl BowConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("ngram_size", self.ngram_size)?;
        require_classes(self.n_o)
    }
}

fn require_positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::ZeroDim { field });
    }
    Ok(())
}

fn require_classes(n_o: usize) -> Result<(), ConfigError> {
    if n_o == 0 {
        return Err(ConfigError::ZeroClasses);
    }
    Ok(())
}

/// `None` means no dropout.
fn dropout_rate(rate: Option<f64>) -> Result<f64, ConfigError> {
    let rate = rate.unwrap_or(0.0);
    if !rate.is_finite() || !(0.0..1.0).contains(&rate) {
        return Err(ConfigError::InvalidDropout { rate });
    }
    Ok(rate)
}

/// Window convolution blocks: `depth` residual layers of
/// expand-window, maxout, layer-norm and dropout.
fn encoder_blocks(
    width: usize,
    depth: usize,
    window: usize,
    pieces: usize,
    rate: f64,
) -> Result<Vec<Model>, NnError> {
    (0..depth)
        .map(|_| {
            residual(chain(vec![
                expand_window(width, window),
                maxout(width, width * (2 * window + 1), pieces),
                layer_norm(width),
                dropout(rate),
            ])?)
        })
        .collect()
}

/// Token-to-vector encoder: hashed NORM/PREFIX/SUFFIX/SHAPE embeddings
/// (plus optional static vectors on ORTH) mixed by a maxout layer, then
/// `conv_depth` residual window convolutions. Output: one
/// `[tokens, width]` array per doc.
pub fn build_tok2vec_model(config: &Tok2VecConfig) -> Result<Model, ConfigError> {
    config.validate()?;
    let rate = dropout_rate(config.dropout)?;
    let width = config.width;
    let half = (config.embed_size / 2).max(1);

    let mut embeds = vec![hash_embed(width, config.embed_size, 0, 6)];
    if config.subword_features {
        embeds.push(hash_embed(width, half, 1, 7));
        embeds.push(hash_embed(width, half, 2, 8));
        embeds.push(hash_embed(width, half, 3, 9));
    }
    if let Some(vectors) = &config.pretrained_vectors {
        embeds.push(static_vectors(width, 4, vectors.to_table()?));
    }
    let mixed_width = width * embeds.len();

    let mut layers = vec![
        feature_extractor(vec![
            Attr::Norm,
            Attr::Prefix,
            Attr::Suffix,
            Attr::Shape,
            Attr::Orth,
        ]),
        concatenate(embeds)?,
        dropout(rate),
        maxout(width, mixed_width, EMBED_PIECES),
        layer_norm(width),
        dropout(rate),
    ];
    layers.extend(encoder_blocks(
        width,
        config.conv_depth,
        config.window_size,
        config.maxout_pieces,
        rate,
    )?);
    Ok(chain(layers)?.with_name("tok2vec"))
}

/// Hashed n-gram bag-of-words classifier. Output: `[docs, n_o]` scores.
pub fn build_bow_text_classifier(config: &BowConfig) -> Result<Model, ConfigError> {
    config.validate()?;
    let activation = if config.exclusive_classes {
        softmax_activation()
    } else {
        logistic()
    };
    Ok(chain(vec![
        extract_ngrams(config.ngram_size, Attr::Orth),
        sparse_linear(config.n_o, BOW_FEATURE_LENGTH),
        activation,
    ])?
    .with_name("textcat_bow"))
}

/// Ensemble of a bag-of-words model and a CNN over hashed LOWER/PREFIX/
/// SUFFIX/SHAPE embeddings, combined by an output layer over both score
/// vectors.
pub fn build_text_classifier(config: &TextClassifierConfig) -> Result<Model, ConfigError> {
    config.validate()?;
    let rate = dropout_rate(config.dropout)?;
    let width = config.width;
    let half = (width / 2).max(1);
    let n_o = config.n_o;

    let mut embeds = vec![
        hash_embed(width, config.embed_size, 1, 10),
        hash_embed(half, config.embed_size, 2, 11),
        hash_embed(half, config.embed_size, 3, 12),
        hash_embed(half, config.embed_size, 4, 13),
    ];
    if let Some(vectors) = &config.pretrained_vectors {
        embeds.push(static_vectors(width, 0, vectors.to_table()?));
    }
    let embed = concatenate(embeds)?;
    let mixed_width = embed.get_dim(DIM_OUT)?;

    let mut cnn_layers = vec![
        feature_extractor(vec![
            Attr::Orth,
            Attr::Lower,
            Attr::Prefix,
            Attr::Suffix,
            Attr::Shape,
        ]),
        embed,
        dropout(rate),
        maxout(width, mixed_width, EMBED_PIECES),
        layer_norm(width),
        dropout(rate),
    ];
    cnn_layers.extend(encoder_blocks(
        width,
        config.conv_depth,
        config.window_size,
        EMBED_PIECES,
        rate,
    )?);
    cnn_layers.push(reduce_mean(width));
    cnn_layers.push(linear(n_o, width));
    let cnn = chain(cnn_layers)?;

    let bow = build_bow_text_classifier(&BowConfig {
        exclusive_classes: config.exclusive_classes,
        ngram_size: config.ngram_size,
        n_o,
    })?;

    let mut layers = vec![concatenate(vec![bow, cnn])?];
    if config.exclusive_classes {
        layers.push(softmax(n_o, 2 * n_o));
    } else {
        layers.push(linear(n_o, 2 * n_o));
        layers.push(dropout(rate));
        layers.push(logistic());
    }
    Ok(chain(layers)?.with_name("textcat_ensemble"))
}

/// Mean-pooled `tok2vec` followed by a softmax (exclusive classes) or a
/// linear layer with logistic outputs.
pub fn build_simple_cnn_text_classifier(
    tok2vec: Model,
    exclusive_classes: bool,
    n_o: usize,
) -> Result<Model, ConfigError> {
    require_classes(n_o)?;
    let width = tok2vec.get_dim(DIM_OUT)?;
    let mut layers = vec![tok2vec, reduce_mean(width)];
    if exclusive_classes {
        layers.push(softmax(n_o, width));
    } else {
        layers.push(linear(n_o, width));
        layers.push(logistic());
    }
    Ok(chain(layers)?.with_name("textcat_cnn"))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;
    use sp_core::Array;
    use sp_nn::{DIM_OUT, Model, Op, Value};
    use sp_random::RandomState;
    use sp_text::{Doc, Tokenizer, example_texts};

    use super::*;

    fn small_tok2vec() -> Tok2VecConfig {
        Tok2VecConfig {
            width: 8,
            embed_size: 50,
            conv_depth: 1,
            maxout_pieces: 2,
            ..Tok2VecConfig::default()
        }
    }

    fn small_textcat() -> TextClassifierConfig {
        TextClassifierConfig {
            width: 8,
            embed_size: 50,
            conv_depth: 1,
            n_o: 3,
            ..TextClassifierConfig::default()
        }
    }

    fn docs() -> Vec<Doc> {
        let tokenizer = Tokenizer::new();
        example_texts()
            .iter()
            .map(|text| tokenizer.tokenize(text))
            .collect()
    }

    fn init(model: Model, seed: u64) -> Model {
        model
            .initialized(&mut RandomState::seeded(seed))
            .expect("initialize should succeed")
    }

    fn predict_batch(model: &Model) -> Array {
        match model.predict(Value::Docs(docs())).expect("predict should succeed") {
            Value::Array(array) => array,
            other => panic!("expected batch scores, got {}", other.kind()),
        }
    }

    #[test]
    fn tok2vec_outputs_one_row_per_token() {
        let model = init(build_tok2vec_model(&small_tok2vec()).expect("build"), 0);
        assert_eq!(model.name(), "tok2vec");
        assert_eq!(model.get_dim(DIM_OUT), Ok(8));
        let corpus = docs();
        let Value::Arrays(arrays) = model.predict(Value::Docs(corpus.clone())).expect("predict")
        else {
            panic!("tok2vec should produce per-doc arrays");
        };
        assert_eq!(arrays.len(), corpus.len());
        for (array, doc) in arrays.iter().zip(&corpus) {
            assert_eq!(array.shape(), &[doc.len(), 8]);
        }
    }

    #[test]
    fn tok2vec_without_subwords_has_single_embedding() {
        let config = Tok2VecConfig {
            subword_features: false,
            ..small_tok2vec()
        };
        let model = build_tok2vec_model(&config).expect("build");
        let embeds = model
            .walk()
            .iter()
            .filter(|node| matches!(node.op(), Op::HashEmbed { .. }))
            .count();
        assert_eq!(embeds, 1);
    }

    #[test]
    fn tok2vec_rejects_unsupported_options() {
        let cases = [
            (
                Tok2VecConfig {
                    char_embed: true,
                    ..small_tok2vec()
                },
                ConfigError::CharEmbedUnsupported,
            ),
            (
                Tok2VecConfig {
                    bilstm_depth: 1,
                    ..small_tok2vec()
                },
                ConfigError::BilstmUnsupported { depth: 1 },
            ),
            (
                Tok2VecConfig {
                    n_m: 64,
                    ..small_tok2vec()
                },
                ConfigError::CharDimsWithoutCharEmbed { n_m: 64, n_c: 0 },
            ),
            (
                Tok2VecConfig {
                    width: 0,
                    ..small_tok2vec()
                },
                ConfigError::ZeroDim { field: "width" },
            ),
            (
                Tok2VecConfig {
                    dropout: Some(1.0),
                    ..small_tok2vec()
                },
                ConfigError::InvalidDropout { rate: 1.0 },
            ),
        ];
        for (config, expected) in cases {
            assert_eq!(build_tok2vec_model(&config), Err(expected));
        }
    }

    #[test]
    fn unknown_config_keys_fail_to_parse() {
        let parsed: Result<Tok2VecConfig, _> =
            serde_json::from_value(json!({ "width": 8, "nope": true }));
        assert!(parsed.is_err());
        let parsed: TextClassifierConfig =
            serde_json::from_value(json!({ "width": 8, "n_o": 2, "dropout": null }))
                .expect("known keys should parse");
        assert_eq!(parsed.width, 8);
        assert_eq!(parsed.embed_size, 2000);
        assert_eq!(parsed.dropout, None);
    }

    #[test]
    fn text_classifier_scores_are_probabilities() {
        let model = init(build_text_classifier(&small_textcat()).expect("build"), 0);
        let scores = predict_batch(&model);
        assert_eq!(scores.shape(), &[docs().len(), 3]);
        assert!(scores.as_slice().iter().all(|p| *p > 0.0 && *p < 1.0));
    }

    #[test]
    fn exclusive_classifiers_normalise_rows() {
        let ensemble = init(
            build_text_classifier(&TextClassifierConfig {
                exclusive_classes: true,
                ..small_textcat()
            })
            .expect("build"),
            1,
        );
        let bow = init(
            build_bow_text_classifier(&BowConfig {
                exclusive_classes: true,
                ngram_size: 2,
                n_o: 4,
            })
            .expect("build"),
            1,
        );
        for scores in [predict_batch(&ensemble), predict_batch(&bow)] {
            for row in 0..scores.rows() {
                let total: f64 = scores.row(row).iter().sum();
                assert!((total - 1.0).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn simple_cnn_wraps_an_owned_tok2vec() {
        let tok2vec = build_tok2vec_model(&small_tok2vec()).expect("tok2vec");
        let model = init(
            build_simple_cnn_text_classifier(tok2vec, false, 5).expect("build"),
            0,
        );
        assert_eq!(model.name(), "textcat_cnn");
        assert_eq!(model.layers()[0].name(), "tok2vec");
        assert_eq!(predict_batch(&model).shape(), &[docs().len(), 5]);

        let tok2vec = build_tok2vec_model(&small_tok2vec()).expect("tok2vec");
        assert_eq!(
            build_simple_cnn_text_classifier(tok2vec, true, 0),
            Err(ConfigError::ZeroClasses)
        );
    }

    #[test]
    fn every_builder_carries_dropout_nodes() {
        let models = [
            build_tok2vec_model(&small_tok2vec()).expect("tok2vec"),
            build_text_classifier(&small_textcat()).expect("textcat"),
        ];
        for model in models {
            let count = model
                .walk()
                .iter()
                .filter(|node| matches!(node.op(), Op::Dropout { .. }))
                .count();
            assert!(count >= 2, "{} has {count} dropout nodes", model.name());
        }
    }

    #[test]
    fn pretrained_vectors_are_validated_and_used() {
        let mut vectors = BTreeMap::new();
        vectors.insert("Apple".to_string(), vec![0.5, -0.5, 0.25]);
        let good = PretrainedVectors { width: 3, vectors };
        let config = Tok2VecConfig {
            pretrained_vectors: Some(good.clone()),
            ..small_tok2vec()
        };
        let model = build_tok2vec_model(&config).expect("build with vectors");
        assert!(
            model
                .walk()
                .iter()
                .any(|node| matches!(node.op(), Op::StaticVectors { .. }))
        );
        let model = init(model, 3);
        assert!(model.predict(Value::Docs(docs())).is_ok());

        let mut bad = good.clone();
        bad.vectors.insert("Banana".to_string(), vec![1.0]);
        assert!(matches!(
            bad.to_table(),
            Err(ConfigError::VectorWidth { actual: 1, .. })
        ));
        let empty = PretrainedVectors {
            width: 0,
            vectors: BTreeMap::new(),
        };
        assert_eq!(
            empty.to_table(),
            Err(ConfigError::ZeroDim {
                field: "pretrained_vectors.width"
            })
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_builds_are_reproducible(seed in any::<u64>(), n_o in 1usize..5) {
            let config = BowConfig { exclusive_classes: false, ngram_size: 2, n_o };
            let a = init(build_bow_text_classifier(&config).expect("build"), seed);
            let b = init(build_bow_text_classifier(&config).expect("build"), seed);
            prop_assert_eq!(predict_batch(&a), predict_batch(&b));
        }
    }
}
