//! Shared (reference-counted) submodules, used for weight tying.
//!
//! A `Shared` handle is the only way to give a module more than one owner, and
//! therefore the only way to build an ownership graph that is not a tree.
//! Every traversal marks the handles on its current path; re-entering a marked
//! handle means the module is its own ancestor and fails with
//! [`ModuleError::CycleDetected`]. A handle that is borrowed outside the
//! traversal fails with [`ModuleError::Borrowed`] instead.

use super::module::{
    Module, ModuleError, ModuleMapper, ModulePath, ModuleResult, ModuleVisitor, ModuleVisitorMut,
};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

struct SharedCell<M> {
    module: RefCell<M>,
    on_path: Cell<bool>,
}

/// Reference-counted, interior-mutable module handle.
///
/// Cloning the handle shares the module. [`Module::map`] produces a new
/// handle, reused for every path that reaches the same source handle.
pub struct Shared<M> {
    inner: Rc<SharedCell<M>>,
}

/// Clears the on-path mark when the traversal leaves the handle.
struct PathMark<'a> {
    flag: &'a Cell<bool>,
}

impl Drop for PathMark<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

impl<M> Shared<M> {
    pub fn new(module: M) -> Self {
        Self {
            inner: Rc::new(SharedCell {
                module: RefCell::new(module),
                on_path: Cell::new(false),
            }),
        }
    }

    /// Immutably borrows the module. Panics if it is mutably borrowed.
    pub fn borrow(&self) -> Ref<'_, M> {
        self.inner.module.borrow()
    }

    /// Mutably borrows the module. Panics if it is already borrowed.
    ///
    /// Traversing the module while the guard is alive fails with
    /// [`ModuleError::Borrowed`].
    pub fn borrow_mut(&self) -> RefMut<'_, M> {
        self.inner.module.borrow_mut()
    }

    /// True when both handles point to the same module.
    pub fn ptr_eq(&self, other: &Shared<M>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn strong_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    fn key(&self) -> usize {
        Rc::as_ptr(&self.inner) as *const () as usize
    }

    fn enter(&self, path: &ModulePath) -> ModuleResult<PathMark<'_>> {
        if self.inner.on_path.get() {
            return Err(ModuleError::CycleDetected(path.qualified()));
        }
        self.inner.on_path.set(true);
        Ok(PathMark {
            flag: &self.inner.on_path,
        })
    }
}

impl<M> Clone for Shared<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<M: fmt::Debug> fmt::Debug for Shared<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inner.on_path.get() {
            return f.write_str("Shared(<cycle>)");
        }
        self.inner.on_path.set(true);
        let result = match self.inner.module.try_borrow() {
            Ok(module) => f.debug_tuple("Shared").field(&*module).finish(),
            Err(_) => f.write_str("Shared(<borrowed>)"),
        };
        self.inner.on_path.set(false);
        result
    }
}

impl<M: Module + 'static> Module for Shared<M> {
    fn visit(&self, path: &mut ModulePath, visitor: &mut dyn ModuleVisitor) -> ModuleResult<()> {
        let _mark = self.enter(path)?;
        let module = self
            .inner
            .module
            .try_borrow()
            .map_err(|_| ModuleError::Borrowed(path.qualified()))?;
        module.visit(path, visitor)
    }

    fn visit_mut(
        &mut self,
        path: &mut ModulePath,
        visitor: &mut dyn ModuleVisitorMut,
    ) -> ModuleResult<()> {
        let _mark = self.enter(path)?;
        let mut module = self
            .inner
            .module
            .try_borrow_mut()
            .map_err(|_| ModuleError::Borrowed(path.qualified()))?;
        module.visit_mut(path, visitor)
    }

    fn map(&self, path: &mut ModulePath, mapper: &mut dyn ModuleMapper) -> ModuleResult<Self> {
        if let Some(inner) = path.copy_of::<SharedCell<M>>(self.key()) {
            return Ok(Shared { inner });
        }
        let _mark = self.enter(path)?;
        let module = self
            .inner
            .module
            .try_borrow()
            .map_err(|_| ModuleError::Borrowed(path.qualified()))?;
        let copy = Shared::new(module.map(path, mapper)?);
        path.remember_copy(self.key(), Rc::clone(&copy.inner));
        Ok(copy)
    }
}
