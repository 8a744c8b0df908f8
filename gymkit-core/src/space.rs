//! Observation and action spaces
//!
//! A [`Space`] describes the set of valid observations or actions of an
//! environment; a [`Sample`] is one element of such a set. Spaces are plain
//! data so they can cross task boundaries, be compared for batching, and be
//! serialized alongside environment specs.

use indexmap::IndexMap;
use ndarray::{ArrayD, IxDyn, Zip};
use rand::Rng;
use rand_distr::{Exp1, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::{GymError, Result};

/// Tolerance used when comparing box bounds for equality
const BOUND_EQ_EPS: f64 = 1e-8;

/// A description of the set of valid observations or actions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Space {
    /// Finite set `{0, 1, ..., n-1}`
    Discrete {
        /// Number of elements
        n: usize,
    },
    /// A (possibly unbounded) box in R^n with per-element bounds
    Box {
        /// Lower bounds, one per element
        low: ArrayD<f64>,
        /// Upper bounds, one per element
        high: ArrayD<f64>,
    },
    /// Fixed-length binary vector
    MultiBinary {
        /// Number of bits
        n: usize,
    },
    /// Named sub-spaces, sampled and flattened in insertion order
    Dict(IndexMap<String, Space>),
}

/// One element of a [`Space`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Sample {
    /// Element of a discrete space
    Discrete(usize),
    /// Element of a box space
    Box(ArrayD<f64>),
    /// Element of a multi-binary space
    MultiBinary(Vec<u8>),
    /// Element of a dict space
    Dict(IndexMap<String, Sample>),
}

impl Sample {
    /// Build a 1-D box sample from a vector
    #[must_use]
    pub fn from_vec(data: Vec<f64>) -> Self {
        let dim = data.len();
        Self::Box(ArrayD::from_shape_vec(IxDyn(&[dim]), data).unwrap())
    }

    /// The discrete value, if this is a discrete sample
    #[must_use]
    pub fn as_discrete(&self) -> Option<usize> {
        match self {
            Self::Discrete(v) => Some(*v),
            _ => None,
        }
    }

    /// The box payload, if this is a box sample
    #[must_use]
    pub fn as_box(&self) -> Option<&ArrayD<f64>> {
        match self {
            Self::Box(arr) => Some(arr),
            _ => None,
        }
    }
}

impl Space {
    /// Create a discrete space with `n` elements
    #[must_use]
    pub fn discrete(n: usize) -> Self {
        Self::Discrete { n }
    }

    /// Create a box space from per-element bounds of equal shape
    pub fn new_box(low: ArrayD<f64>, high: ArrayD<f64>) -> Result<Self> {
        if low.shape() != high.shape() {
            return Err(GymError::DimensionMismatch {
                expected: low.len(),
                actual: high.len(),
            });
        }
        Ok(Self::Box { low, high })
    }

    /// Create a 1-D box space from bound vectors
    pub fn box1d(low: Vec<f64>, high: Vec<f64>) -> Result<Self> {
        if low.len() != high.len() {
            return Err(GymError::DimensionMismatch {
                expected: low.len(),
                actual: high.len(),
            });
        }
        let dim = low.len();
        Ok(Self::Box {
            low: ArrayD::from_shape_vec(IxDyn(&[dim]), low).unwrap(),
            high: ArrayD::from_shape_vec(IxDyn(&[dim]), high).unwrap(),
        })
    }

    /// Create a box space with identical scalar bounds for every element
    #[must_use]
    pub fn box_scalar(low: f64, high: f64, shape: &[usize]) -> Self {
        Self::Box {
            low: ArrayD::from_elem(IxDyn(shape), low),
            high: ArrayD::from_elem(IxDyn(shape), high),
        }
    }

    /// Create a multi-binary space with `n` bits
    #[must_use]
    pub fn multi_binary(n: usize) -> Self {
        Self::MultiBinary { n }
    }

    /// Create a dict space from named sub-spaces
    pub fn dict<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Space)>,
    {
        let map: IndexMap<String, Space> = entries.into_iter().collect();
        if map.is_empty() {
            return Err(GymError::Environment(
                "A Dict space cannot be empty".to_string(),
            ));
        }
        Ok(Self::Dict(map))
    }

    /// Draw a random element of this space
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Sample {
        match self {
            Self::Discrete { n } => Sample::Discrete(rng.gen_range(0..*n)),
            Self::Box { low, high } => {
                let data = Zip::from(low).and(high).map_collect(|&l, &h| {
                    match (l.is_finite(), h.is_finite()) {
                        // Bounded interval: uniform
                        (true, true) => {
                            if l < h {
                                rng.gen_range(l..h)
                            } else {
                                l
                            }
                        }
                        // Half-open intervals: shifted exponential
                        (true, false) => {
                            let e: f64 = rng.sample(Exp1);
                            l + e
                        }
                        (false, true) => {
                            let e: f64 = rng.sample(Exp1);
                            h - e
                        }
                        // Unbounded: standard normal
                        (false, false) => rng.sample(StandardNormal),
                    }
                });
                Sample::Box(data)
            }
            Self::MultiBinary { n } => {
                Sample::MultiBinary((0..*n).map(|_| u8::from(rng.gen::<bool>())).collect())
            }
            Self::Dict(entries) => Sample::Dict(
                entries
                    .iter()
                    .map(|(k, space)| (k.clone(), space.sample(rng)))
                    .collect(),
            ),
        }
    }

    /// Check whether a sample is a member of this space
    #[must_use]
    pub fn contains(&self, sample: &Sample) -> bool {
        match (self, sample) {
            (Self::Discrete { n }, Sample::Discrete(v)) => v < n,
            (Self::Box { low, high }, Sample::Box(arr)) => {
                arr.shape() == low.shape()
                    && arr
                        .iter()
                        .zip(low.iter())
                        .zip(high.iter())
                        .all(|((x, l), h)| x >= l && x <= h)
            }
            (Self::MultiBinary { n }, Sample::MultiBinary(bits)) => {
                bits.len() == *n && bits.iter().all(|&b| b <= 1)
            }
            (Self::Dict(spaces), Sample::Dict(values)) => {
                spaces.len() == values.len()
                    && spaces.iter().all(|(k, space)| {
                        values.get(k).is_some_and(|v| space.contains(v))
                    })
            }
            _ => false,
        }
    }

    /// Shape of elements, `None` for dict spaces
    #[must_use]
    pub fn shape(&self) -> Option<Vec<usize>> {
        match self {
            Self::Discrete { .. } => Some(vec![]),
            Self::Box { low, .. } => Some(low.shape().to_vec()),
            Self::MultiBinary { n } => Some(vec![*n]),
            Self::Dict(_) => None,
        }
    }

    /// Length of the flattened representation
    #[must_use]
    pub fn flat_dim(&self) -> usize {
        match self {
            Self::Discrete { n } | Self::MultiBinary { n } => *n,
            Self::Box { low, .. } => low.len(),
            Self::Dict(entries) => entries.values().map(Space::flat_dim).sum(),
        }
    }

    /// Flatten a sample of this space into a feature vector
    ///
    /// Discrete samples flatten one-hot; dict samples flatten keywise in
    /// insertion order.
    pub fn flatten(&self, sample: &Sample) -> Result<Vec<f64>> {
        let mut out = Vec::with_capacity(self.flat_dim());
        self.flatten_into(sample, &mut out)?;
        Ok(out)
    }

    fn flatten_into(&self, sample: &Sample, out: &mut Vec<f64>) -> Result<()> {
        match (self, sample) {
            (Self::Discrete { n }, Sample::Discrete(v)) if v < n => {
                out.extend((0..*n).map(|i| if i == *v { 1.0 } else { 0.0 }));
                Ok(())
            }
            (Self::Box { low, .. }, Sample::Box(arr)) if arr.shape() == low.shape() => {
                out.extend(arr.iter().copied());
                Ok(())
            }
            (Self::MultiBinary { n }, Sample::MultiBinary(bits)) if bits.len() == *n => {
                out.extend(bits.iter().map(|&b| f64::from(b)));
                Ok(())
            }
            (Self::Dict(spaces), Sample::Dict(values)) => {
                for (key, space) in spaces {
                    let value = values.get(key).ok_or_else(|| {
                        GymError::Environment(format!("missing dict sample key `{key}`"))
                    })?;
                    space.flatten_into(value, out)?;
                }
                Ok(())
            }
            _ => Err(GymError::Environment(
                "sample does not belong to this space".to_string(),
            )),
        }
    }

    /// The 1-D box space that [`flatten`](Self::flatten) maps into
    #[must_use]
    pub fn flatten_space(&self) -> Space {
        let (mut low, mut high) = (Vec::new(), Vec::new());
        self.flat_bounds(&mut low, &mut high);
        let dim = low.len();
        Space::Box {
            low: ArrayD::from_shape_vec(IxDyn(&[dim]), low).unwrap(),
            high: ArrayD::from_shape_vec(IxDyn(&[dim]), high).unwrap(),
        }
    }

    fn flat_bounds(&self, low: &mut Vec<f64>, high: &mut Vec<f64>) {
        match self {
            Self::Discrete { n } | Self::MultiBinary { n } => {
                low.extend(std::iter::repeat(0.0).take(*n));
                high.extend(std::iter::repeat(1.0).take(*n));
            }
            Self::Box { low: l, high: h } => {
                low.extend(l.iter().copied());
                high.extend(h.iter().copied());
            }
            Self::Dict(entries) => {
                for space in entries.values() {
                    space.flat_bounds(low, high);
                }
            }
        }
    }
}

fn bounds_close(a: &ArrayD<f64>, b: &ArrayD<f64>) -> bool {
    a.shape() == b.shape()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x == y || (x - y).abs() < BOUND_EQ_EPS)
}

impl PartialEq for Space {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Discrete { n: a }, Self::Discrete { n: b })
            | (Self::MultiBinary { n: a }, Self::MultiBinary { n: b }) => a == b,
            (
                Self::Box { low: l1, high: h1 },
                Self::Box { low: l2, high: h2 },
            ) => bounds_close(l1, l2) && bounds_close(h1, h2),
            (Self::Dict(a), Self::Dict(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, s)| b.get(k).is_some_and(|o| s == o))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_discrete_sample_and_contains() {
        let space = Space::discrete(4);
        let mut rng = rng();
        for _ in 0..50 {
            let s = space.sample(&mut rng);
            assert!(space.contains(&s));
        }
        assert!(!space.contains(&Sample::Discrete(4)));
        assert!(!space.contains(&Sample::from_vec(vec![1.0])));
    }

    #[test]
    fn test_box_bound_mismatch() {
        let err = Space::box1d(vec![0.0, 0.0], vec![1.0]).unwrap_err();
        assert!(matches!(err, GymError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_box_sampling_respects_boundedness() {
        let space = Space::box1d(
            vec![0.0, 0.0, f64::NEG_INFINITY, f64::NEG_INFINITY],
            vec![1.0, f64::INFINITY, 1.0, f64::INFINITY],
        )
        .unwrap();
        let mut rng = rng();
        for _ in 0..100 {
            let s = space.sample(&mut rng);
            let arr = s.as_box().unwrap();
            assert!(arr[0] >= 0.0 && arr[0] <= 1.0);
            assert!(arr[1] >= 0.0);
            assert!(arr[2] <= 1.0);
            assert!(arr[3].is_finite());
        }
    }

    #[test]
    fn test_dict_cannot_be_empty() {
        assert!(Space::dict(Vec::new()).is_err());
    }

    #[test]
    fn test_dict_preserves_insertion_order() {
        let space = Space::dict(vec![
            ("b".to_string(), Space::discrete(2)),
            ("a".to_string(), Space::box_scalar(0.0, 1.0, &[2])),
        ])
        .unwrap();
        let mut rng = rng();
        let Sample::Dict(values) = space.sample(&mut rng) else {
            panic!("dict space must produce dict samples");
        };
        let keys: Vec<&str> = values.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["b", "a"]);
        // Flattened layout follows the same order: 2 one-hot slots then 2 box slots
        assert_eq!(space.flat_dim(), 4);
    }

    #[test]
    fn test_dict_equality_is_order_insensitive() {
        let a = Space::dict(vec![
            ("x".to_string(), Space::discrete(2)),
            ("y".to_string(), Space::box_scalar(0.0, 1.0, &[3])),
        ])
        .unwrap();
        let b = Space::dict(vec![
            ("y".to_string(), Space::box_scalar(0.0, 1.0, &[3])),
            ("x".to_string(), Space::discrete(2)),
        ])
        .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, Space::discrete(2));
    }

    #[test]
    fn test_nested_dict_sampling() {
        let space = Space::dict(vec![
            ("a".to_string(), Space::box_scalar(0.0, 1.0, &[3, 3])),
            (
                "b".to_string(),
                Space::dict(vec![
                    ("b_1".to_string(), Space::box_scalar(-100.0, 100.0, &[2])),
                    ("b_2".to_string(), Space::box_scalar(-1.0, 1.0, &[2])),
                ])
                .unwrap(),
            ),
            ("c".to_string(), Space::discrete(5)),
        ])
        .unwrap();
        let mut rng = rng();
        for _ in 0..10 {
            let s = space.sample(&mut rng);
            assert!(space.contains(&s));
        }
        assert_eq!(space.flat_dim(), 9 + 2 + 2 + 5);
    }

    #[test]
    fn test_discrete_flattens_one_hot() {
        let space = Space::discrete(3);
        assert_eq!(space.flatten(&Sample::Discrete(1)).unwrap(), vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_flatten_space_bounds() {
        let space = Space::dict(vec![
            ("d".to_string(), Space::discrete(2)),
            ("b".to_string(), Space::box1d(vec![-2.0], vec![2.0]).unwrap()),
        ])
        .unwrap();
        let flat = space.flatten_space();
        assert_eq!(
            flat,
            Space::box1d(vec![0.0, 0.0, -2.0], vec![1.0, 1.0, 2.0]).unwrap()
        );
    }

    #[test]
    fn test_flatten_rejects_foreign_sample() {
        let space = Space::box_scalar(0.0, 1.0, &[2]);
        assert!(space.flatten(&Sample::Discrete(0)).is_err());
    }

    proptest! {
        #[test]
        fn prop_bounded_box_samples_are_contained(
            dims in proptest::collection::vec((-100.0f64..100.0, 0.01f64..50.0), 1..6),
            seed in any::<u64>(),
        ) {
            let low: Vec<f64> = dims.iter().map(|(l, _)| *l).collect();
            let high: Vec<f64> = dims.iter().map(|(l, w)| l + w).collect();
            let space = Space::box1d(low, high).unwrap();
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            let s = space.sample(&mut rng);
            prop_assert!(space.contains(&s));
            prop_assert_eq!(space.flatten(&s).unwrap().len(), space.flat_dim());
        }
    }
}
