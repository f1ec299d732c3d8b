//! Conversion of tensors and whole module trees to a memory layout.

use crate::config::ConvertConfig;
use crate::format::{Format, IntoFormat};
use crate::nn::{Module, ModuleMapper, ModulePath, ModuleResult, ModuleVisitorMut};
use crate::tensor::{Relayout, Tensor, TensorKind};
use std::borrow::Cow;
use tracing::{debug, info};

/// Counts of what a module conversion did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversionReport {
    /// Tensors visited.
    pub visited: usize,
    /// Tensors whose raw storage was permuted.
    pub permuted: usize,
    /// Tensors that only needed a new tag.
    pub retagged: usize,
    /// Tensors already in the target format.
    pub unchanged: usize,
}

impl ConversionReport {
    /// Counts one converted tensor.
    pub fn record(&mut self, relayout: Relayout) {
        self.visited += 1;
        match relayout {
            Relayout::Permuted => self.permuted += 1,
            Relayout::Retagged => self.retagged += 1,
            Relayout::Unchanged => self.unchanged += 1,
        }
    }
}

/// Converts one tensor to `target`.
///
/// Rank-4 and rank-5 tensors are re-laid out in memory; any other tensor
/// only gets the new tag. A tensor already in `target` is left untouched.
pub fn convert_tensor_format(tensor: &mut Tensor, target: Format) -> Relayout {
    tensor.set_format(target)
}

struct FormatRewriter {
    target: Format,
    report: ConversionReport,
}

impl FormatRewriter {
    fn new(target: Format) -> Self {
        Self {
            target,
            report: ConversionReport::default(),
        }
    }

    fn convert(&mut self, name: &str, kind: TensorKind, tensor: &mut Tensor) {
        let from = tensor.format();
        let relayout = convert_tensor_format(tensor, self.target);
        debug!(tensor = name, ?kind, %from, to = %self.target, ?relayout, "converted tensor");
        self.report.record(relayout);
    }
}

impl ModuleVisitorMut for FormatRewriter {
    fn visit_tensor_mut(&mut self, name: &str, kind: TensorKind, tensor: &mut Tensor) -> ModuleResult<()> {
        self.convert(name, kind, tensor);
        Ok(())
    }
}

/// Walks a module mutably without touching any tensor, surfacing cycles and
/// outside borrows before a rewrite starts.
struct DryRun;

impl ModuleVisitorMut for DryRun {
    fn visit_tensor_mut(&mut self, _: &str, _: TensorKind, _: &mut Tensor) -> ModuleResult<()> {
        Ok(())
    }
}

impl ModuleMapper for FormatRewriter {
    fn map_tensor(&mut self, name: &str, kind: TensorKind, tensor: &Tensor) -> ModuleResult<Tensor> {
        let mut converted = tensor.clone();
        self.convert(name, kind, &mut converted);
        Ok(converted)
    }
}

/// Converts every tensor of `module` as described by `config`.
///
/// In place, the returned `Cow` borrows `module` itself. Otherwise `module`
/// is left untouched and an independent converted copy is returned. On error
/// no tensor of `module` has been modified.
pub fn convert_module_with<'a, M: Module>(
    module: &'a mut M,
    config: &ConvertConfig,
) -> ModuleResult<(Cow<'a, M>, ConversionReport)> {
    let mut rewriter = FormatRewriter::new(config.target);
    let mut path = ModulePath::new();

    let converted = if config.in_place {
        module.visit_mut(&mut ModulePath::new(), &mut DryRun)?;
        module.visit_mut(&mut path, &mut rewriter)?;
        let module: &'a M = module;
        Cow::Borrowed(module)
    } else {
        Cow::Owned(module.map(&mut path, &mut rewriter)?)
    };

    let report = rewriter.report;
    info!(
        target_format = %config.target,
        in_place = config.in_place,
        visited = report.visited,
        permuted = report.permuted,
        retagged = report.retagged,
        unchanged = report.unchanged,
        "converted module format"
    );
    Ok((converted, report))
}

/// Converts every tensor of `module` to `target`.
///
/// `target` is a [`Format`] or its identifier; an unsupported identifier
/// fails with [`FormatError::InvalidFormat`](crate::format::FormatError).
pub fn convert_module_format_to<M: Module, F: IntoFormat>(
    module: &mut M,
    target: F,
    in_place: bool,
) -> ModuleResult<Cow<'_, M>> {
    let config = ConvertConfig::new(target.into_format()?).with_in_place(in_place);
    convert_module_with(module, &config).map(|(converted, _)| converted)
}

/// Converts every tensor of `module` to `nhwc`, the layout used by mixed
/// precision convolution kernels.
pub fn convert_module_format<M: Module>(module: &mut M, in_place: bool) -> ModuleResult<Cow<'_, M>> {
    convert_module_format_to(module, Format::Nhwc, in_place)
}
