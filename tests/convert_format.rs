//! Integration tests for converting whole module trees to a memory layout.

use rusty_amp::amp::{convert_module_format, convert_module_format_to, convert_module_with};
use rusty_amp::config::ConvertConfig;
use rusty_amp::format::Format;
use rusty_amp::nn::{
    named_tensors, BatchNorm2d, Conv2d, Conv2dConfig, Linear, ModuleError, Shared,
};
use rusty_amp::serialization::{load_module, save_module};
use rusty_amp::tensor::{Parameter, Tensor};

use approx::assert_abs_diff_eq;
use proptest::prelude::*;
use std::borrow::Cow;

#[derive(Debug, Clone)]
struct InnerModule {
    bn: BatchNorm2d,
}

rusty_amp::module!(InnerModule { bn });

#[derive(Debug, Clone)]
struct MyModule {
    i: InnerModule,
    conv: Conv2d,
    bn: BatchNorm2d,
    param: Parameter,
    buff: Tensor,
}

rusty_amp::module!(MyModule { i, conv, bn, param, buff });

fn my_module() -> MyModule {
    MyModule {
        i: InnerModule {
            bn: BatchNorm2d::new(4).unwrap(),
        },
        conv: Conv2d::from_config(Conv2dConfig::new(4, 4, (4, 4)).with_groups(2)).unwrap(),
        bn: BatchNorm2d::new(4).unwrap(),
        param: Parameter::new(Tensor::ones(&[1, 3, 1, 1])),
        buff: Tensor::ones(&[1, 3, 1, 1]),
    }
}

fn formats(module: &MyModule) -> Vec<(String, Format)> {
    named_tensors(module)
        .unwrap()
        .into_iter()
        .map(|(name, tensor)| (name, tensor.format()))
        .collect()
}

#[test]
fn test_convert_module_in_place() {
    let mut m = my_module();
    let m = convert_module_format(&mut m, true).unwrap();

    let tensors = named_tensors(m.as_ref()).unwrap();
    assert_eq!(tensors.len(), 12);
    for (name, tensor) in tensors {
        assert_eq!(tensor.format(), Format::Nhwc, "{} was not converted", name);
    }
}

#[test]
fn test_convert_module_copy() {
    let mut m = my_module();
    let converted = convert_module_format(&mut m, false).unwrap().into_owned();

    for (name, tensor) in named_tensors(&converted).unwrap() {
        assert_eq!(tensor.format(), Format::Nhwc, "{} was not converted", name);
    }
}

#[test]
fn test_every_leaf_is_reached() {
    let mut m = my_module();
    convert_module_format(&mut m, true).unwrap();

    let names: Vec<String> = formats(&m).into_iter().map(|(name, _)| name).collect();
    assert_eq!(
        names,
        vec![
            "i.bn.weight",
            "i.bn.bias",
            "i.bn.running_mean",
            "i.bn.running_var",
            "conv.weight",
            "conv.bias",
            "bn.weight",
            "bn.bias",
            "bn.running_mean",
            "bn.running_var",
            "param",
            "buff",
        ]
    );
    assert_eq!(m.i.bn.running_var.as_ref().unwrap().format(), Format::Nhwc);
    assert_eq!(m.param.format(), Format::Nhwc);
    assert_eq!(m.buff.format(), Format::Nhwc);
}

#[test]
fn test_in_place_returns_same_module() {
    let mut m = my_module();
    let address: *const MyModule = &m;

    let converted = convert_module_format(&mut m, true).unwrap();
    assert!(matches!(converted, Cow::Borrowed(_)));
    assert!(std::ptr::eq(converted.as_ref(), address));
}

#[test]
fn test_copy_leaves_original_untouched() {
    let mut m = my_module();
    let before = named_tensors(&m).unwrap();

    let converted = convert_module_format(&mut m, false).unwrap().into_owned();

    assert!(formats(&m).iter().all(|(_, format)| *format == Format::Default));
    assert_eq!(named_tensors(&m).unwrap(), before);
    assert!(!converted.conv.weight.shares_storage(&m.conv.weight));
    // logical values survive the conversion
    assert_eq!(converted.conv.weight.to_array(), m.conv.weight.to_array());
}

#[test]
fn test_conversion_is_idempotent() {
    let mut m = my_module();
    convert_module_format(&mut m, true).unwrap();
    let once = named_tensors(&m).unwrap();

    let config = ConvertConfig::new(Format::Nhwc);
    let (_, report) = convert_module_with(&mut m, &config).unwrap();
    assert_eq!(report.unchanged, report.visited);
    assert_eq!(report.visited, 12);

    let twice = named_tensors(&m).unwrap();
    assert_eq!(once, twice);
    for ((_, a), (_, b)) in once.iter().zip(twice.iter()) {
        assert!(a.shares_storage(b));
    }
}

#[test]
fn test_conversion_permutes_image_storage() {
    let mut m = my_module();
    let config = ConvertConfig::new(Format::Nhwc);
    let (_, report) = convert_module_with(&mut m, &config).unwrap();

    // every tensor of MyModule is rank 4 or 5
    assert_eq!(report.permuted, 12);
    assert_eq!(m.conv.weight.shape(), vec![2, 2, 2, 4, 4]);
    assert_eq!(m.conv.weight.storage_shape(), vec![2, 2, 4, 4, 2]);
    assert_eq!(m.bn.weight.as_ref().unwrap().storage_shape(), vec![1, 1, 1, 4]);
}

#[test]
fn test_convert_back_to_nchw() {
    let original = my_module();
    let mut m = original.clone();
    convert_module_format(&mut m, true).unwrap();
    convert_module_format_to(&mut m, "nchw", true).unwrap();

    assert!(formats(&m).iter().all(|(_, format)| *format == Format::Nchw));
    assert_eq!(m.conv.weight.to_array(), original.conv.weight.to_array());
    assert_eq!(m.conv.weight.storage_shape(), vec![2, 2, 2, 4, 4]);
}

#[test]
fn test_module_without_leaves() {
    #[derive(Debug, Clone)]
    struct Nothing {
        children: Vec<Nothing>,
    }
    rusty_amp::module!(Nothing { children });

    let mut empty = Nothing {
        children: vec![Nothing { children: vec![] }],
    };
    let converted = convert_module_format(&mut empty, false).unwrap();
    assert!(named_tensors(converted.as_ref()).unwrap().is_empty());
}

#[test]
fn test_deeply_nested_modules() {
    #[derive(Debug, Clone)]
    struct Chain {
        weight: Parameter,
        next: Option<Box<Chain>>,
    }

    rusty_amp::module!(Chain { weight, next });

    let mut chain = Chain {
        weight: Parameter::new(Tensor::ones(&[1, 2, 1, 1])),
        next: None,
    };
    for _ in 0..32 {
        chain = Chain {
            weight: Parameter::new(Tensor::ones(&[1, 2, 1, 1])),
            next: Some(Box::new(chain)),
        };
    }

    let converted = convert_module_format(&mut chain, false).unwrap().into_owned();
    let tensors = named_tensors(&converted).unwrap();
    assert_eq!(tensors.len(), 33);
    assert!(tensors.iter().all(|(_, t)| t.format() == Format::Nhwc));
    assert!(tensors.last().unwrap().0.starts_with("next.next.next"));
}

#[test]
fn test_mixed_ranks_are_all_tagged() {
    #[derive(Debug, Clone)]
    struct Head {
        conv: Conv2d,
        fc: Linear,
    }
    rusty_amp::module!(Head { conv, fc });

    let mut head = Head {
        conv: Conv2d::new(3, 8, (3, 3)).unwrap(),
        fc: Linear::new(8, 2).unwrap(),
    };
    let (_, report) = convert_module_with(&mut head, &ConvertConfig::default()).unwrap();

    assert_eq!(report.permuted, 2);
    assert_eq!(report.retagged, 2);
    assert_eq!(head.fc.weight.format(), Format::Nhwc);
    assert_eq!(head.fc.weight.storage_shape(), vec![2, 8]);
}

#[test]
fn test_shared_cycle_fails_conversion() {
    #[derive(Debug, Clone)]
    struct Node {
        weight: Parameter,
        next: Option<Shared<Node>>,
    }
    rusty_amp::module!(Node { weight, next });

    #[derive(Debug, Clone)]
    struct Root {
        stem: Parameter,
        head: Shared<Node>,
    }
    rusty_amp::module!(Root { stem, head });

    let head = Shared::new(Node {
        weight: Parameter::new(Tensor::ones(&[1, 1, 2, 2])),
        next: None,
    });
    head.borrow_mut().next = Some(head.clone());

    let mut root = Root {
        stem: Parameter::new(Tensor::ones(&[1, 2, 2, 2])),
        head: head.clone(),
    };
    let err = convert_module_format(&mut root, true).unwrap_err();
    assert_eq!(err, ModuleError::CycleDetected("head.next".to_string()));

    // tensors reached before the cycle are left as they were
    assert_eq!(root.stem.format(), Format::Default);
    assert_eq!(head.borrow().weight.format(), Format::Default);

    let err = convert_module_format(&mut root, false).unwrap_err();
    assert!(matches!(err, ModuleError::CycleDetected(_)));
    assert_eq!(root.stem.format(), Format::Default);

    head.borrow_mut().next = None;
}

#[test]
fn test_outside_borrow_fails_without_converting() {
    #[derive(Debug, Clone)]
    struct Pair {
        first: Parameter,
        second: Shared<BatchNorm2d>,
    }
    rusty_amp::module!(Pair { first, second });

    let shared = Shared::new(BatchNorm2d::new(2).unwrap());
    let mut pair = Pair {
        first: Parameter::new(Tensor::ones(&[1, 2, 1, 1])),
        second: shared.clone(),
    };

    let guard = shared.borrow();
    let err = convert_module_format(&mut pair, true).unwrap_err();
    assert_eq!(err, ModuleError::Borrowed("second".to_string()));
    assert_eq!(pair.first.format(), Format::Default);
    drop(guard);

    convert_module_format(&mut pair, true).unwrap();
    assert_eq!(pair.first.format(), Format::Nhwc);
}

#[test]
fn test_tied_weights_convert_once() {
    #[derive(Debug, Clone)]
    struct Tied {
        a: Shared<BatchNorm2d>,
        b: Shared<BatchNorm2d>,
    }
    rusty_amp::module!(Tied { a, b });

    let shared = Shared::new(BatchNorm2d::new(2).unwrap());
    let mut tied = Tied {
        a: shared.clone(),
        b: shared.clone(),
    };

    let (_, report) = convert_module_with(&mut tied, &ConvertConfig::default()).unwrap();
    assert_eq!(report.visited, 8);
    assert_eq!(report.permuted, 4);
    assert_eq!(report.unchanged, 4);
    assert_eq!(
        shared.borrow().running_mean.as_ref().unwrap().format(),
        Format::Nhwc
    );
}

#[test]
fn test_copy_keeps_tied_weights_tied() {
    #[derive(Debug, Clone)]
    struct Tied {
        a: Shared<BatchNorm2d>,
        b: Shared<BatchNorm2d>,
        c: Shared<BatchNorm2d>,
    }
    rusty_amp::module!(Tied { a, b, c });

    let shared = Shared::new(BatchNorm2d::new(2).unwrap());
    let mut tied = Tied {
        a: shared.clone(),
        b: shared.clone(),
        c: Shared::new(BatchNorm2d::new(2).unwrap()),
    };

    let copy = convert_module_format(&mut tied, false).unwrap().into_owned();

    assert!(copy.a.ptr_eq(&copy.b));
    assert!(!copy.a.ptr_eq(&tied.a));
    assert!(!copy.a.ptr_eq(&copy.c));
    assert_eq!(copy.a.borrow().weight.as_ref().unwrap().format(), Format::Nhwc);
    assert_eq!(shared.borrow().weight.as_ref().unwrap().format(), Format::Default);
}

#[test]
fn test_converted_module_round_trips_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");

    let mut m = my_module();
    m.bn.running_mean.as_mut().unwrap().fill(0.25);
    convert_module_format(&mut m, true).unwrap();
    save_module(&path, &m).unwrap();

    let mut restored = my_module();
    load_module(&path, &mut restored, true).unwrap();

    // destination keeps its own format; values come from the file
    assert!(formats(&restored).iter().all(|(_, f)| *f == Format::Default));
    let mean = restored.bn.running_mean.as_ref().unwrap().to_array();
    for value in mean.iter() {
        assert_abs_diff_eq!(*value, 0.25, epsilon = 1e-7);
    }
    assert_eq!(restored.conv.weight.to_array(), m.conv.weight.to_array());
}

fn image_shape() -> impl Strategy<Value = Vec<usize>> {
    prop_oneof![
        prop::collection::vec(1usize..4, 4),
        prop::collection::vec(1usize..3, 5),
        prop::collection::vec(1usize..5, 1..4),
    ]
}

proptest! {
    #[test]
    fn prop_conversion_preserves_logical_values(shape in image_shape(), target in 0usize..3) {
        let n: usize = shape.iter().product();
        let tensor = Tensor::from_vec(&shape, (0..n).map(|x| x as f32).collect()).unwrap();
        let format = Format::ALL[target];

        let mut tensors = vec![tensor.clone(), tensor.clone().with_format(Format::Nhwc)];
        let converted = convert_module_format_to(&mut tensors, format, false).unwrap().into_owned();

        for t in &converted {
            prop_assert_eq!(t.format(), format);
            prop_assert_eq!(t.shape(), shape.clone());
            prop_assert_eq!(t.to_array(), tensor.to_array());
        }
        prop_assert_eq!(tensors[0].format(), Format::Default);
        prop_assert_eq!(tensors[1].format(), Format::Nhwc);
    }

    #[test]
    fn prop_every_leaf_reaches_target(count in 0usize..6, target in 0usize..3, in_place: bool) {
        let format = Format::ALL[target];
        let mut layers: Vec<BatchNorm2d> = (0..count).map(|i| BatchNorm2d::new(i + 1).unwrap()).collect();

        let converted = convert_module_format_to(&mut layers, format, in_place).unwrap().into_owned();
        let tensors = named_tensors(&converted).unwrap();

        prop_assert_eq!(tensors.len(), count * 4);
        for (_, tensor) in tensors {
            prop_assert_eq!(tensor.format(), format);
        }
    }
}
