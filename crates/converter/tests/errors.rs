mod common;

use anime4k_converter::{Error, Format, WriteOptions};
use common::{arch, model};

const SHADERS: [Format; 3] = [Format::Comp, Format::Glsl, Format::Hlsl];

#[test]
fn test_non_finite_values_are_rejected_by_every_writer() {
    let mut model = model(arch(4, 2, 2, 1, 1));
    model.mid_biases[0][3] = f32::NAN;
    for format in [Format::Safetensors, Format::Comp, Format::Glsl, Format::Hlsl] {
        let err = format.encode(&model, &WriteOptions::default()).unwrap_err();
        assert!(matches!(err, Error::NonFinite(ref name) if name == "mid[0].bias"), "{format}: {err}");
    }
}

#[test]
fn test_json_has_no_writer() {
    let model = model(arch(4, 2, 2, 1, 1));
    assert!(matches!(Format::StateDictJson.encode(&model, &WriteOptions::default()), Err(Error::ReadOnlyFormat(".json"))));
}

#[test]
fn test_empty_sources_are_rejected() {
    for format in Format::ALL {
        assert!(format.decode(b"").is_err(), "{format}");
    }
}

#[test]
fn test_truncated_shaders_are_rejected() {
    let model = model(arch(8, 5, 2, 3, 1));
    for format in SHADERS {
        let bytes = format.encode(&model, &WriteOptions::default()).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(format.decode(truncated).is_err(), "{format}");
    }
}

#[test]
fn test_dialects_do_not_parse_each_other() {
    let model = model(arch(8, 3, 2, 2, 1));
    for written in SHADERS {
        let bytes = written.encode(&model, &WriteOptions::default()).unwrap();
        for reader in SHADERS.into_iter().filter(|r| *r != written) {
            assert!(reader.decode(&bytes).is_err(), "{reader} accepted {written}");
        }
    }
}

#[test]
fn test_malformed_literal_is_reported() {
    let model = model(arch(4, 2, 2, 1, 1));
    let code = String::from_utf8(Format::Hlsl.encode(&model, &WriteOptions::default()).unwrap()).unwrap();
    let code = code.replacen("MF3x4(", "MF3x4(bogus, ", 1);
    assert!(matches!(Format::Hlsl.decode(code.as_bytes()), Err(Error::InvalidLiteral(_))));
}

#[test]
fn test_invalid_checkpoint_bytes() {
    assert!(matches!(Format::Safetensors.decode(b"not a safetensors file"), Err(Error::SafeTensors(_))));
    assert!(matches!(Format::StateDictJson.decode(b"[1, 2, 3]"), Err(Error::StructuralMismatch(_))));
    assert!(matches!(Format::StateDictJson.decode(b"{"), Err(Error::Json(_))));
}
