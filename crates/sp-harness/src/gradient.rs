//! Random upstream gradients shaped like a model's output.

use sp_core::Output;
use sp_nn::Value;
use sp_random::RandomState;

use crate::HarnessError;

pub const GRADIENT_LOW: f64 = -1.0;
pub const GRADIENT_HIGH: f64 = 1.0;

/// Same structure as `output`, every element drawn from `U[-1, 1)`. Leaves
/// are filled in structural order, so the draw sequence depends only on the
/// shapes.
pub fn synthesize_gradient(rng: &mut RandomState, output: &Output) -> Result<Output, HarnessError> {
    match output {
        Output::Array(array) => Ok(Output::Array(rng.uniform(
            array.shape().to_vec(),
            GRADIENT_LOW,
            GRADIENT_HIGH,
        )?)),
        Output::Sequence(items) => items
            .iter()
            .map(|item| synthesize_gradient(rng, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Output::Sequence),
    }
}

/// Gradient for a raw model value. Only arrays and per-doc arrays have a
/// numeric shape to mirror.
pub fn synthesize_for_value(rng: &mut RandomState, value: &Value) -> Result<Value, HarnessError> {
    let unsupported = || HarnessError::UnsupportedOutput {
        context: "gradient",
        kind: value.kind(),
    };
    let output = value.to_output().ok_or_else(unsupported)?;
    let gradient = synthesize_gradient(rng, &output)?;
    Value::from_output(gradient).ok_or_else(unsupported)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use sp_core::{Array, Output};
    use sp_nn::Value;
    use sp_random::RandomState;
    use sp_text::Tokenizer;

    use super::{synthesize_for_value, synthesize_gradient};
    use crate::HarnessError;

    #[test]
    fn gradient_values_stay_in_range() {
        let output = Output::Array(Array::zeros(vec![16, 8]));
        let gradient = synthesize_gradient(&mut RandomState::seeded(3), &output).expect("draws");
        let Output::Array(array) = gradient else {
            panic!("array in, array out");
        };
        assert_eq!(array.shape(), &[16, 8]);
        assert!(array.as_slice().iter().all(|v| (-1.0..1.0).contains(v)));
    }

    #[test]
    fn same_seed_gives_same_gradient() {
        let output = Output::Sequence(vec![
            Output::Array(Array::zeros(vec![2, 3])),
            Output::Array(Array::zeros(vec![4, 3])),
        ]);
        let a = synthesize_gradient(&mut RandomState::seeded(9), &output).expect("a");
        let b = synthesize_gradient(&mut RandomState::seeded(9), &output).expect("b");
        assert_eq!(a, b);
    }

    #[test]
    fn per_doc_arrays_round_trip_to_values() {
        let value = Value::Arrays(vec![Array::zeros(vec![3, 2]), Array::zeros(vec![0, 2])]);
        let gradient = synthesize_for_value(&mut RandomState::seeded(0), &value).expect("arrays");
        let Value::Arrays(arrays) = gradient else {
            panic!("expected per-doc arrays");
        };
        assert_eq!(arrays.len(), 2);
        assert_eq!(arrays[0].shape(), &[3, 2]);
        assert_eq!(arrays[1].shape(), &[0, 2]);
    }

    #[test]
    fn non_numeric_values_are_rejected() {
        let docs = Value::Docs(vec![Tokenizer::new().tokenize("Where are you?")]);
        let err = synthesize_for_value(&mut RandomState::seeded(0), &docs)
            .expect_err("docs have no numeric shape");
        assert_eq!(
            err,
            HarnessError::UnsupportedOutput {
                context: "gradient",
                kind: "docs",
            }
        );

        let err = synthesize_for_value(&mut RandomState::seeded(0), &Value::Features(vec![]))
            .expect_err("feature ids have no numeric shape");
        assert!(matches!(err, HarnessError::UnsupportedOutput { kind: "features", .. }));
    }

    fn output_strategy() -> impl Strategy<Value = Output> {
        let leaf = proptest::collection::vec(0usize..5, 0..3)
            .prop_map(|shape| Output::Array(Array::zeros(shape)));
        leaf.prop_recursive(3, 16, 4, |inner| {
            proptest::collection::vec(inner, 0..4).prop_map(Output::Sequence)
        })
    }

    fn same_structure(lhs: &Output, rhs: &Output) -> bool {
        match (lhs, rhs) {
            (Output::Array(a), Output::Array(b)) => a.shape() == b.shape(),
            (Output::Sequence(a), Output::Sequence(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| same_structure(x, y))
            }
            _ => false,
        }
    }

    proptest! {
        #[test]
        fn prop_gradient_mirrors_output_structure(output in output_strategy(), seed in any::<u64>()) {
            let gradient = synthesize_gradient(&mut RandomState::seeded(seed), &output)
                .expect("valid range");
            prop_assert!(same_structure(&output, &gradient));
            prop_assert_eq!(output.shape_signature(), gradient.shape_signature());
            prop_assert_eq!(output.leaf_count(), gradient.leaf_count());
        }
    }
}
