//! Module state: an ordered name → tensor map and loading it back into a module.

use super::module::{
    named_tensors, Module, ModuleError, ModuleMapper, ModulePath, ModuleResult, ModuleVisitor,
    ModuleVisitorMut,
};
use crate::tensor::{Tensor, TensorKind};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Named tensors in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDict {
    entries: Vec<(String, Tensor)>,
    index: HashMap<String, usize>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a tensor. A replaced entry keeps its position.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        let name = name.into();
        match self.index.get(&name) {
            Some(&i) => Some(std::mem::replace(&mut self.entries[i].1, tensor)),
            None => {
                self.index.insert(name.clone(), self.entries.len());
                self.entries.push((name, tensor));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.index.get(name).map(|&i| &self.entries[i].1)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        match self.index.get(name) {
            Some(&i) => Some(&mut self.entries[i].1),
            None => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Tensor)> {
        self.entries
            .iter_mut()
            .map(|(name, tensor)| (name.as_str(), tensor))
    }
}

impl FromIterator<(String, Tensor)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        let mut dict = StateDict::new();
        for (name, tensor) in iter {
            dict.insert(name, tensor);
        }
        dict
    }
}

impl IntoIterator for StateDict {
    type Item = (String, Tensor);
    type IntoIter = std::vec::IntoIter<(String, Tensor)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// A dict is a flat module: every entry is a buffer named by its key.
impl Module for StateDict {
    fn visit(&self, path: &mut ModulePath, visitor: &mut dyn ModuleVisitor) -> ModuleResult<()> {
        for (name, tensor) in &self.entries {
            path.scoped(name, |path| tensor.visit(path, visitor))?;
        }
        Ok(())
    }

    fn visit_mut(
        &mut self,
        path: &mut ModulePath,
        visitor: &mut dyn ModuleVisitorMut,
    ) -> ModuleResult<()> {
        for (name, tensor) in self.entries.iter_mut() {
            path.scoped(name, |path| tensor.visit_mut(path, visitor))?;
        }
        Ok(())
    }

    fn map(&self, path: &mut ModulePath, mapper: &mut dyn ModuleMapper) -> ModuleResult<Self> {
        let mut mapped = StateDict::new();
        for (name, tensor) in &self.entries {
            let tensor = path.scoped(name, |path| tensor.map(path, mapper))?;
            mapped.insert(name.clone(), tensor);
        }
        Ok(mapped)
    }
}

/// Snapshot of every tensor of `module`, in traversal order.
pub fn state_dict<M: Module>(module: &M) -> ModuleResult<StateDict> {
    Ok(named_tensors(module)?.into_iter().collect())
}

/// Keys that did not line up during a lenient load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    /// Module tensors with no entry in the dict; left untouched.
    pub missing: Vec<String>,
    /// Dict entries that match no module tensor; ignored.
    pub unexpected: Vec<String>,
}

struct StateLoader<'a> {
    dict: &'a StateDict,
}

impl ModuleVisitorMut for StateLoader<'_> {
    fn visit_tensor_mut(&mut self, name: &str, _: TensorKind, tensor: &mut Tensor) -> ModuleResult<()> {
        if let Some(source) = self.dict.get(name) {
            tensor
                .set_data(source.to_array())
                .map_err(|_| ModuleError::ShapeMismatch {
                    name: name.to_string(),
                    expected: tensor.shape(),
                    actual: source.shape(),
                })?;
        }
        Ok(())
    }
}

/// Copies the values of `dict` into the tensors of `module`.
///
/// Every destination keeps its own format. Names and shapes are checked before
/// anything is written, so a failed load leaves the module unchanged. With
/// `strict`, missing and unexpected keys are errors; otherwise they are
/// reported in the returned [`LoadOutcome`].
pub fn load_state_dict<M: Module>(
    module: &mut M,
    dict: &StateDict,
    strict: bool,
) -> ModuleResult<LoadOutcome> {
    let current = named_tensors(module)?;
    let known: HashSet<&str> = current.iter().map(|(name, _)| name.as_str()).collect();

    let mut outcome = LoadOutcome::default();
    for (name, tensor) in &current {
        match dict.get(name) {
            Some(source) if source.shape() != tensor.shape() => {
                return Err(ModuleError::ShapeMismatch {
                    name: name.clone(),
                    expected: tensor.shape(),
                    actual: source.shape(),
                });
            }
            Some(_) => {}
            None => outcome.missing.push(name.clone()),
        }
    }
    outcome.unexpected = dict
        .names()
        .filter(|name| !known.contains(name))
        .map(str::to_string)
        .collect();

    if strict {
        if let Some(name) = outcome.missing.first() {
            return Err(ModuleError::MissingTensor(name.clone()));
        }
        if let Some(name) = outcome.unexpected.first() {
            return Err(ModuleError::UnexpectedTensor(name.clone()));
        }
    } else if !outcome.missing.is_empty() || !outcome.unexpected.is_empty() {
        warn!(
            missing = ?outcome.missing,
            unexpected = ?outcome.unexpected,
            "state dict does not match module"
        );
    }

    module.visit_mut(&mut ModulePath::new(), &mut StateLoader { dict })?;
    Ok(outcome)
}
