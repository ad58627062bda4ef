mod common;

use anime4k_converter::formats::checkpoint::{self, StateDict};
use anime4k_converter::formats::pth;
use anime4k_converter::{Format, WriteOptions};
use common::{arch, assert_bit_exact, coverage_archs, model};
use serde_json::Value;

const WRITABLE: [Format; 5] = [Format::Pth, Format::Safetensors, Format::Comp, Format::Glsl, Format::Hlsl];

#[test]
fn test_checkpoint_round_trip_is_bit_exact() {
    for arch in coverage_archs() {
        let model = model(arch);
        let bytes = checkpoint::write_safetensors(&model).unwrap();
        assert_bit_exact(&checkpoint::read_safetensors(&bytes).unwrap(), &model);

        let dict = checkpoint::read_safetensors_state_dict(&bytes).unwrap();
        assert_eq!(dict, StateDict::from_model(&model).unwrap());
    }
}

#[test]
fn test_every_format_reads_back_its_own_output() {
    let options = WriteOptions::default();
    for arch in coverage_archs() {
        let model = model(arch);
        for format in WRITABLE {
            let bytes = format.encode(&model, &options).unwrap();
            let reread = format.decode(&bytes).unwrap_or_else(|e| panic!("{format} for {arch}: {e}"));
            assert_bit_exact(&reread, &model);
        }
    }
}

#[test]
fn test_every_format_pair() {
    let options = WriteOptions::default();
    for arch in coverage_archs() {
        let model = model(arch);
        for from in WRITABLE {
            let intermediate = from.decode(&from.encode(&model, &options).unwrap()).unwrap();
            for to in WRITABLE {
                let bytes = to.encode(&intermediate, &options).unwrap();
                let reread = to.decode(&bytes).unwrap_or_else(|e| panic!("{from} -> {to} for {arch}: {e}"));
                assert_bit_exact(&reread, &model);
            }
        }
    }
}

#[test]
fn test_shader_output_is_deterministic() {
    let options = WriteOptions::default();
    let model = model(arch(8, 3, 2, 2, 3));
    for format in [Format::Comp, Format::Glsl, Format::Hlsl] {
        let first = format.encode(&model, &options).unwrap();
        let via_checkpoint = checkpoint::read_safetensors(&checkpoint::write_safetensors(&model).unwrap()).unwrap();
        assert_eq!(format.encode(&via_checkpoint, &options).unwrap(), first, "{format}");
    }
}

#[test]
fn test_pth_and_safetensors_hold_the_same_state_dict() {
    for arch in coverage_archs() {
        let model = model(arch);
        let from_pth = pth::read_pth_state_dict(&pth::write_pth(&model).unwrap()).unwrap();
        let from_safetensors = checkpoint::read_safetensors_state_dict(&checkpoint::write_safetensors(&model).unwrap()).unwrap();
        assert_eq!(from_pth, from_safetensors, "{arch}");
    }
}

fn nested(shape: &[usize], data: &[f32]) -> Value {
    match shape {
        [] => Value::from(data[0] as f64),
        [_] => Value::Array(data.iter().map(|&v| Value::from(v as f64)).collect()),
        [n, rest @ ..] => {
            let stride = data.len() / n;
            Value::Array(data.chunks(stride).map(|chunk| nested(rest, chunk)).collect())
        }
    }
}

#[test]
fn test_json_state_dict_matches_safetensors() {
    let model = model(arch(8, 3, 2, 2, 1));
    let dict = StateDict::from_model(&model).unwrap();
    let mut tensors = serde_json::Map::new();
    for key in dict.keys() {
        let tensor = dict.get(key).unwrap();
        tensors.insert(key.to_string(), nested(&tensor.shape, &tensor.data));
    }
    let mut root = serde_json::Map::new();
    root.insert("params_ema".to_string(), Value::Object(tensors));
    let text = serde_json::to_string(&Value::Object(root)).unwrap();

    let from_json = Format::StateDictJson.decode(text.as_bytes()).unwrap();
    assert_bit_exact(&from_json, &model);
}

#[test]
fn test_pass_counts() {
    let options = WriteOptions::default();
    let model = model(arch(8, 5, 2, 3, 1));

    let hlsl = String::from_utf8(Format::Hlsl.encode(&model, &options).unwrap()).unwrap();
    assert_eq!(hlsl.lines().filter(|l| l.starts_with("//!PASS ")).count(), 6);
    assert_eq!(Format::Hlsl.decode(hlsl.as_bytes()).unwrap().arch, model.arch);

    let comp = String::from_utf8(Format::Comp.encode(&model, &options).unwrap()).unwrap();
    assert_eq!(comp.lines().filter(|l| l.trim_start().starts_with("if (PASS == ")).count(), 7);

    // two textures per layer, three aggregation groups and the depth-to-space hook
    let glsl = String::from_utf8(Format::Glsl.encode(&model, &options).unwrap()).unwrap();
    assert_eq!(glsl.lines().filter(|l| l.starts_with("//!DESC ")).count(), 2 * 5 + 3 + 1);
}

#[test]
fn test_descriptor_include_only_affects_comp() {
    let model = model(arch(4, 2, 2, 1, 1));
    let custom = WriteOptions {
        descriptor_include: "include/sets.h".to_string(),
    };
    let comp = String::from_utf8(Format::Comp.encode(&model, &custom).unwrap()).unwrap();
    assert!(comp.contains("include/sets.h"));
    assert!(!comp.contains("../../descriptor_set.h"));
    for format in [Format::Glsl, Format::Hlsl] {
        assert_eq!(format.encode(&model, &custom).unwrap(), format.encode(&model, &WriteOptions::default()).unwrap(), "{format}");
    }
}
