//! Module tree traversal.
//!
//! Every layer implements [`Module`], exposing its parameters and activation
//! leaves under PyTorch-style dotted names (`backbone.dark2.1.m.0.conv1.conv.weight`).
//! Read-only walks go through a [`ModuleVisitor`], in-place rewrites through a
//! [`ModuleMapper`]. State dict IO and activation substitution are built on
//! those two walks.

use std::collections::BTreeMap;

use tracing::debug;

use crate::activation::{Activation, ActivationKind};
use crate::error::{ModelError, Result};
use crate::param::Param;
use crate::state::StateDict;

/// Read-only walk over a module tree.
pub trait ModuleVisitor {
    /// Called for every parameter and buffer.
    fn visit_param(&mut self, name: &str, param: &Param);

    /// Called for every activation leaf.
    fn visit_activation(&mut self, _name: &str, _activation: &Activation) {}
}

/// In-place rewrite of a module tree.
pub trait ModuleMapper {
    /// Called for every parameter and buffer.
    fn map_param(&mut self, _name: &str, _param: &mut Param) {}

    /// Called for every activation leaf.
    fn map_activation(&mut self, _name: &str, _activation: &mut Activation) {}
}

/// A node in the module tree.
pub trait Module {
    /// Walks parameters and activation leaves below `prefix`.
    fn visit(&self, prefix: &str, visitor: &mut dyn ModuleVisitor);

    /// Rewrites parameters and activation leaves below `prefix` in place.
    fn map(&mut self, prefix: &str, mapper: &mut dyn ModuleMapper);

    /// All parameters and buffers with their dotted names, in traversal order.
    fn named_parameters(&self) -> Vec<(String, Param)> {
        struct Collect(Vec<(String, Param)>);
        impl ModuleVisitor for Collect {
            fn visit_param(&mut self, name: &str, param: &Param) {
                self.0.push((name.to_string(), param.clone()));
            }
        }
        let mut collect = Collect(Vec::new());
        self.visit("", &mut collect);
        collect.0
    }

    /// Number of learnable elements, excluding buffers.
    fn num_params(&self) -> usize {
        struct Count(usize);
        impl ModuleVisitor for Count {
            fn visit_param(&mut self, _name: &str, param: &Param) {
                if !param.is_buffer() {
                    self.0 += param.numel();
                }
            }
        }
        let mut count = Count(0);
        self.visit("", &mut count);
        count.0
    }

    /// Snapshot of every parameter and buffer.
    fn state_dict(&self) -> StateDict {
        self.named_parameters().into_iter().collect()
    }

    /// Copies checkpoint values into the module.
    ///
    /// Loading is strict and all-or-nothing: names, shapes and dtypes are
    /// validated first, and nothing is written unless every entry matches.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::StateMismatch` listing missing, unexpected and
    /// mis-shaped entries.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let declared: BTreeMap<String, Param> = self.named_parameters().into_iter().collect();
        let missing: Vec<String> = declared
            .keys()
            .filter(|name| !state.contains(name))
            .cloned()
            .collect();
        let unexpected: Vec<String> = state
            .names()
            .filter(|name| !declared.contains_key(*name))
            .map(str::to_string)
            .collect();
        let mismatched: Vec<String> = declared
            .iter()
            .filter_map(|(name, param)| {
                let loaded = state.get(name)?;
                (loaded.shape() != param.shape() || loaded.dtype() != param.dtype()).then(|| {
                    format!(
                        "{name}: expected {}, got {}",
                        param.describe(),
                        loaded.describe()
                    )
                })
            })
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() || !mismatched.is_empty() {
            return Err(ModelError::state_mismatch(missing, unexpected, mismatched));
        }

        struct Assign<'a>(&'a StateDict);
        impl ModuleMapper for Assign<'_> {
            fn map_param(&mut self, name: &str, param: &mut Param) {
                if let Some(loaded) = self.0.get(name) {
                    param.assign(loaded);
                }
            }
        }
        self.map("", &mut Assign(state));
        debug!(entries = state.len(), "loaded state dict");
        Ok(())
    }

    /// Replaces every activation leaf of kind `from` with `to`.
    ///
    /// Returns the number of leaves replaced.
    fn replace_activation(&mut self, from: ActivationKind, to: Activation) -> usize {
        struct Replace {
            from: ActivationKind,
            to: Activation,
            count: usize,
        }
        impl ModuleMapper for Replace {
            fn map_activation(&mut self, _name: &str, activation: &mut Activation) {
                if activation.kind() == self.from {
                    *activation = self.to;
                    self.count += 1;
                }
            }
        }
        let mut replace = Replace { from, to, count: 0 };
        self.map("", &mut replace);
        replace.count
    }
}

/// Joins a parent prefix and a child name with a dot.
#[must_use]
pub fn child(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

impl<M: Module> Module for Vec<M> {
    fn visit(&self, prefix: &str, visitor: &mut dyn ModuleVisitor) {
        for (i, m) in self.iter().enumerate() {
            m.visit(&child(prefix, &i.to_string()), visitor);
        }
    }

    fn map(&mut self, prefix: &str, mapper: &mut dyn ModuleMapper) {
        for (i, m) in self.iter_mut().enumerate() {
            m.map(&child(prefix, &i.to_string()), mapper);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Leaf {
        weight: Param,
        running: Param,
        act: Activation,
    }

    impl Module for Leaf {
        fn visit(&self, prefix: &str, visitor: &mut dyn ModuleVisitor) {
            visitor.visit_param(&child(prefix, "weight"), &self.weight);
            visitor.visit_param(&child(prefix, "running"), &self.running);
            visitor.visit_activation(&child(prefix, "act"), &self.act);
        }

        fn map(&mut self, prefix: &str, mapper: &mut dyn ModuleMapper) {
            mapper.map_param(&child(prefix, "weight"), &mut self.weight);
            mapper.map_param(&child(prefix, "running"), &mut self.running);
            mapper.map_activation(&child(prefix, "act"), &mut self.act);
        }
    }

    fn tree() -> Vec<Leaf> {
        (0..2)
            .map(|_| Leaf {
                weight: Param::zeros(&[2, 2]),
                running: Param::zeros(&[2]).into_buffer(),
                act: Activation::Silu,
            })
            .collect()
    }

    #[test]
    fn names_are_dotted() {
        let names: Vec<_> = tree().named_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["0.weight", "0.running", "1.weight", "1.running"]);
    }

    #[test]
    fn num_params_skips_buffers() {
        assert_eq!(tree().num_params(), 8);
        assert_eq!(tree().state_dict().numel(), 12);
    }

    #[test]
    fn load_matching_state() {
        let mut model = tree();
        let mut state = model.state_dict();
        state.insert("1.weight", Param::filled(&[2, 2], 0.25));
        assert!(model.load_state_dict(&state).is_ok());
        let loaded = model.state_dict();
        let bits: Vec<u32> = loaded
            .get("1.weight")
            .map(|p| p.as_f32().unwrap_or_default().iter().map(|v| v.to_bits()).collect())
            .unwrap_or_default();
        assert_eq!(bits, vec![0.25_f32.to_bits(); 4]);
        assert!(model[1].running.is_buffer());
    }

    #[test]
    fn mismatch_is_all_or_nothing() {
        let mut model = tree();
        let mut state = model.state_dict();
        state.insert("0.weight", Param::filled(&[2, 2], 1.0));
        state.insert("1.weight", Param::filled(&[3, 2], 1.0));
        state.remove("1.running");
        state.insert("extra", Param::zeros(&[1]));

        let err = model.load_state_dict(&state);
        match err {
            Err(ModelError::StateMismatch {
                missing,
                unexpected,
                mismatched,
            }) => {
                assert_eq!(missing, vec!["1.running".to_string()]);
                assert_eq!(unexpected, vec!["extra".to_string()]);
                assert_eq!(mismatched.len(), 1);
                assert!(mismatched[0].starts_with("1.weight"));
            }
            other => panic!("expected state mismatch, got {other:?}"),
        }
        let untouched = model.state_dict();
        assert_eq!(
            untouched.get("0.weight").map(|p| p.as_f32().unwrap_or_default().to_vec()),
            Some(vec![0.0; 4])
        );
    }

    #[test]
    fn dtype_mismatch_is_reported() {
        let mut model = tree();
        let mut state = model.state_dict();
        state.insert("0.running", Param::from_i64(&[2], vec![0, 0]).unwrap());
        assert!(matches!(
            model.load_state_dict(&state),
            Err(ModelError::StateMismatch { .. })
        ));
    }

    #[test]
    fn replace_counts_leaves() {
        let mut model = tree();
        assert_eq!(
            model.replace_activation(ActivationKind::Silu, Activation::ExportSilu),
            2
        );
        assert_eq!(
            model.replace_activation(ActivationKind::Silu, Activation::ExportSilu),
            0
        );
        assert!(model.iter().all(|l| l.act == Activation::ExportSilu));
    }
}
