//! Module defining the core `Module` trait and the traversal machinery.
//!
//! A module owns named submodules and named tensor attributes. Which fields
//! are registered, and in which order, is declared once per type with the
//! [`module!`](crate::module) macro, so every traversal is deterministic:
//! depth-first, in registration order. Qualified names join field names with
//! `.` (e.g. `block.bn.running_mean`), `Vec` entries use their index and `Box` adds no segment.

use crate::format::FormatError;
use crate::tensor::{Parameter, Tensor, TensorKind};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

pub type ModuleResult<T> = std::result::Result<T, ModuleError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModuleError {
    #[error("cycle detected in module graph at '{0}'")]
    CycleDetected(String),
    #[error("shared module at '{0}' is already borrowed")]
    Borrowed(String),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("missing tensor '{0}'")]
    MissingTensor(String),
    #[error("unexpected tensor '{0}'")]
    UnexpectedTensor(String),
    #[error("invalid module configuration: {0}")]
    InvalidConfig(String),
}

/// Qualified name of the position currently being traversed.
///
/// During [`Module::map`] the path also remembers the copy made of every
/// shared handle, so handles that alias in the source alias in the copy.
#[derive(Debug, Clone, Default)]
pub struct ModulePath {
    segments: Vec<String>,
    copies: HashMap<usize, Rc<dyn Any>>,
}

impl ModulePath {
    /// Path of a root module.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with `segment` appended to the path.
    pub fn scoped<T>(&mut self, segment: &str, f: impl FnOnce(&mut Self) -> T) -> T {
        self.segments.push(segment.to_string());
        let out = f(self);
        self.segments.pop();
        out
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// `.`-joined name of the current position, empty at the root.
    pub fn qualified(&self) -> String {
        self.segments.join(".")
    }

    /// Copy already made for the shared value at `key`, if any.
    pub(crate) fn copy_of<T: Any>(&self, key: usize) -> Option<Rc<T>> {
        let copy = Rc::clone(self.copies.get(&key)?);
        copy.downcast::<T>().ok()
    }

    pub(crate) fn remember_copy<T: Any>(&mut self, key: usize, copy: Rc<T>) {
        self.copies.insert(key, copy);
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

/// Read-only access to every tensor of a module tree.
pub trait ModuleVisitor {
    fn visit_tensor(&mut self, name: &str, kind: TensorKind, tensor: &Tensor) -> ModuleResult<()>;
}

/// Mutable access to every tensor of a module tree.
pub trait ModuleVisitorMut {
    fn visit_tensor_mut(
        &mut self,
        name: &str,
        kind: TensorKind,
        tensor: &mut Tensor,
    ) -> ModuleResult<()>;
}

/// Produces the tensors of a new module tree from the tensors of an existing one.
pub trait ModuleMapper {
    fn map_tensor(&mut self, name: &str, kind: TensorKind, tensor: &Tensor) -> ModuleResult<Tensor>;
}

impl<F> ModuleVisitor for F
where
    F: FnMut(&str, TensorKind, &Tensor) -> ModuleResult<()>,
{
    fn visit_tensor(&mut self, name: &str, kind: TensorKind, tensor: &Tensor) -> ModuleResult<()> {
        self(name, kind, tensor)
    }
}

/// Trait for all neural network modules.
///
/// Implement it with the [`module!`](crate::module) registration macro rather
/// than by hand. Leaves (`Tensor`, `Parameter`) and containers (`Option`, `Box`,
/// `Vec`, [`Shared`](super::Shared)) already implement it.
pub trait Module: Clone + fmt::Debug {
    /// Visits each tensor in the module with a [visitor](ModuleVisitor).
    fn visit(&self, path: &mut ModulePath, visitor: &mut dyn ModuleVisitor) -> ModuleResult<()>;

    /// Visits each tensor mutably with a [visitor](ModuleVisitorMut).
    fn visit_mut(
        &mut self,
        path: &mut ModulePath,
        visitor: &mut dyn ModuleVisitorMut,
    ) -> ModuleResult<()>;

    /// Builds a structurally identical module whose tensors come from a [mapper](ModuleMapper).
    ///
    /// The returned module does not share any `Shared` handle with `self`;
    /// handles shared within `self` are shared the same way within the result.
    fn map(&self, path: &mut ModulePath, mapper: &mut dyn ModuleMapper) -> ModuleResult<Self>;
}

/// Registers the submodules and tensor attributes of a module type.
///
/// Fields are traversed in the order they are listed; fields that are not
/// listed (configs, flags) are copied as is by [`Module::map`].
///
/// ```rust,ignore
/// #[derive(Debug, Clone)]
/// struct Block { conv: Conv2d, bn: BatchNorm2d, scale: Parameter, stride: usize }
/// rusty_amp::module!(Block { conv, bn, scale });
/// ```
#[macro_export]
macro_rules! module {
    ($ty:ty { $($field:ident),* $(,)? }) => {
        impl $crate::nn::Module for $ty {
            #[allow(unused_variables)]
            fn visit(
                &self,
                path: &mut $crate::nn::ModulePath,
                visitor: &mut dyn $crate::nn::ModuleVisitor,
            ) -> $crate::nn::ModuleResult<()> {
                $(
                    path.scoped(stringify!($field), |path| {
                        $crate::nn::Module::visit(&self.$field, path, visitor)
                    })?;
                )*
                ::std::result::Result::Ok(())
            }

            #[allow(unused_variables)]
            fn visit_mut(
                &mut self,
                path: &mut $crate::nn::ModulePath,
                visitor: &mut dyn $crate::nn::ModuleVisitorMut,
            ) -> $crate::nn::ModuleResult<()> {
                $(
                    path.scoped(stringify!($field), |path| {
                        $crate::nn::Module::visit_mut(&mut self.$field, path, visitor)
                    })?;
                )*
                ::std::result::Result::Ok(())
            }

            #[allow(unused_variables, unused_mut)]
            fn map(
                &self,
                path: &mut $crate::nn::ModulePath,
                mapper: &mut dyn $crate::nn::ModuleMapper,
            ) -> $crate::nn::ModuleResult<Self> {
                let mut mapped = ::std::clone::Clone::clone(self);
                $(
                    mapped.$field = path.scoped(stringify!($field), |path| {
                        $crate::nn::Module::map(&self.$field, path, mapper)
                    })?;
                )*
                ::std::result::Result::Ok(mapped)
            }
        }
    };
}

impl Module for Tensor {
    fn visit(&self, path: &mut ModulePath, visitor: &mut dyn ModuleVisitor) -> ModuleResult<()> {
        visitor.visit_tensor(&path.qualified(), TensorKind::Buffer, self)
    }

    fn visit_mut(
        &mut self,
        path: &mut ModulePath,
        visitor: &mut dyn ModuleVisitorMut,
    ) -> ModuleResult<()> {
        visitor.visit_tensor_mut(&path.qualified(), TensorKind::Buffer, self)
    }

    fn map(&self, path: &mut ModulePath, mapper: &mut dyn ModuleMapper) -> ModuleResult<Self> {
        mapper.map_tensor(&path.qualified(), TensorKind::Buffer, self)
    }
}

impl Module for Parameter {
    fn visit(&self, path: &mut ModulePath, visitor: &mut dyn ModuleVisitor) -> ModuleResult<()> {
        visitor.visit_tensor(&path.qualified(), TensorKind::Parameter, self.tensor())
    }

    fn visit_mut(
        &mut self,
        path: &mut ModulePath,
        visitor: &mut dyn ModuleVisitorMut,
    ) -> ModuleResult<()> {
        visitor.visit_tensor_mut(&path.qualified(), TensorKind::Parameter, self.tensor_mut())
    }

    fn map(&self, path: &mut ModulePath, mapper: &mut dyn ModuleMapper) -> ModuleResult<Self> {
        let tensor = mapper.map_tensor(&path.qualified(), TensorKind::Parameter, self.tensor())?;
        let mut param = Parameter::new(tensor);
        param.requires_grad = self.requires_grad;
        Ok(param)
    }
}

impl<M: Module> Module for Option<M> {
    fn visit(&self, path: &mut ModulePath, visitor: &mut dyn ModuleVisitor) -> ModuleResult<()> {
        match self {
            Some(module) => module.visit(path, visitor),
            None => Ok(()),
        }
    }

    fn visit_mut(
        &mut self,
        path: &mut ModulePath,
        visitor: &mut dyn ModuleVisitorMut,
    ) -> ModuleResult<()> {
        match self {
            Some(module) => module.visit_mut(path, visitor),
            None => Ok(()),
        }
    }

    fn map(&self, path: &mut ModulePath, mapper: &mut dyn ModuleMapper) -> ModuleResult<Self> {
        match self {
            Some(module) => Ok(Some(module.map(path, mapper)?)),
            None => Ok(None),
        }
    }
}

impl<M: Module> Module for Box<M> {
    fn visit(&self, path: &mut ModulePath, visitor: &mut dyn ModuleVisitor) -> ModuleResult<()> {
        (**self).visit(path, visitor)
    }

    fn visit_mut(
        &mut self,
        path: &mut ModulePath,
        visitor: &mut dyn ModuleVisitorMut,
    ) -> ModuleResult<()> {
        (**self).visit_mut(path, visitor)
    }

    fn map(&self, path: &mut ModulePath, mapper: &mut dyn ModuleMapper) -> ModuleResult<Self> {
        Ok(Box::new((**self).map(path, mapper)?))
    }
}

impl<M: Module> Module for Vec<M> {
    fn visit(&self, path: &mut ModulePath, visitor: &mut dyn ModuleVisitor) -> ModuleResult<()> {
        for (i, module) in self.iter().enumerate() {
            path.scoped(&i.to_string(), |path| module.visit(path, visitor))?;
        }
        Ok(())
    }

    fn visit_mut(
        &mut self,
        path: &mut ModulePath,
        visitor: &mut dyn ModuleVisitorMut,
    ) -> ModuleResult<()> {
        for (i, module) in self.iter_mut().enumerate() {
            path.scoped(&i.to_string(), |path| module.visit_mut(path, visitor))?;
        }
        Ok(())
    }

    fn map(&self, path: &mut ModulePath, mapper: &mut dyn ModuleMapper) -> ModuleResult<Self> {
        let mut mapped = Vec::with_capacity(self.len());
        for (i, module) in self.iter().enumerate() {
            mapped.push(path.scoped(&i.to_string(), |path| module.map(path, mapper))?);
        }
        Ok(mapped)
    }
}

fn collect_tensors<M: Module>(
    module: &M,
    filter: Option<TensorKind>,
) -> ModuleResult<Vec<(String, Tensor)>> {
    let mut tensors = Vec::new();
    let mut collect = |name: &str, kind: TensorKind, tensor: &Tensor| -> ModuleResult<()> {
        if filter.map_or(true, |wanted| wanted == kind) {
            tensors.push((name.to_string(), tensor.clone()));
        }
        Ok(())
    };
    module.visit(&mut ModulePath::new(), &mut collect)?;
    Ok(tensors)
}

/// Every tensor reachable from `module` with its qualified name, depth-first
/// in registration order. Tensors are copy-on-write snapshots.
pub fn named_tensors<M: Module>(module: &M) -> ModuleResult<Vec<(String, Tensor)>> {
    collect_tensors(module, None)
}

/// Learnable tensors only.
pub fn named_parameters<M: Module>(module: &M) -> ModuleResult<Vec<(String, Tensor)>> {
    collect_tensors(module, Some(TensorKind::Parameter))
}

/// Plain tensor attributes only.
pub fn named_buffers<M: Module>(module: &M) -> ModuleResult<Vec<(String, Tensor)>> {
    collect_tensors(module, Some(TensorKind::Buffer))
}

/// Total number of parameter elements.
pub fn num_params<M: Module>(module: &M) -> ModuleResult<usize> {
    let mut count = 0;
    let mut counter = |_: &str, kind: TensorKind, tensor: &Tensor| -> ModuleResult<()> {
        if kind == TensorKind::Parameter {
            count += tensor.len();
        }
        Ok(())
    };
    module.visit(&mut ModulePath::new(), &mut counter)?;
    Ok(count)
}
