mod common;

use std::path::Path;
use std::process::{Command, Output};

use anime4k_converter::Format;
use anime4k_converter::formats::checkpoint;
use common::{arch, assert_bit_exact, model};

fn convert(args: &[&Path]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_convert")).args(args).output().unwrap()
}

#[test]
fn test_converts_checkpoint_to_every_shader() {
    let dir = tempfile::tempdir().unwrap();
    let model = model(arch(8, 5, 2, 3, 1));
    let input = dir.path().join("model.safetensors");
    std::fs::write(&input, checkpoint::write_safetensors(&model).unwrap()).unwrap();

    for name in ["model.comp", "model.glsl", "model.HLSL"] {
        let output = dir.path().join(name);
        let result = convert(&[&input, &output]);
        assert!(result.status.success(), "{}", String::from_utf8_lossy(&result.stderr));

        let stdout = String::from_utf8(result.stdout).unwrap();
        let extension = Format::detect(&output).unwrap().extension();
        assert!(stdout.starts_with(&format!("Converted .safetensors -> {extension}: ")), "{stdout}");
        assert!(stdout.trim_end().ends_with("(M)"), "{stdout}");

        let written = Format::detect(&output).unwrap().read(&output).unwrap();
        assert_bit_exact(&written, &model);
    }
}

#[test]
fn test_verbose_prints_architecture() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("net.safetensors");
    let output = dir.path().join("net.hlsl");
    std::fs::write(&input, checkpoint::write_safetensors(&model(arch(8, 5, 2, 3, 1))).unwrap()).unwrap();

    let result = Command::new(env!("CARGO_BIN_EXE_convert")).arg(&input).arg(&output).arg("--verbose").output().unwrap();
    assert!(result.status.success());
    let stdout = String::from_utf8(result.stdout).unwrap();
    assert!(stdout.contains("Architecture: Anime4K CNN x2 M\n"));
    assert!(stdout.contains("num_feat=8, block_depth=5, factor=2, n_stack=3, tail_kernel=1"));
    assert!(stdout.contains("Total passes: 7\n"));
}

#[test]
fn test_verbose_prints_architecture_before_a_failed_write() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("net.safetensors");
    let output = dir.path().join("missing").join("net.hlsl");
    std::fs::write(&input, checkpoint::write_safetensors(&model(arch(8, 3, 2, 3, 3))).unwrap()).unwrap();

    let result = Command::new(env!("CARGO_BIN_EXE_convert")).arg(&input).arg(&output).arg("--verbose").output().unwrap();
    assert_eq!(result.status.code(), Some(1));
    let stdout = String::from_utf8(result.stdout).unwrap();
    assert!(stdout.contains("Architecture: Anime4K CNN x2 "));
    assert!(stdout.contains("Total passes: "));
    assert!(!stdout.contains("Converted"));
    assert!(String::from_utf8(result.stderr).unwrap().contains("Error: "));
    assert!(!output.exists());
}

#[test]
fn test_pth_checkpoint_converts_to_shader() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("net_G.pth");
    let output = dir.path().join("net.glsl");
    let expected = model(arch(4, 2, 2, 1, 1));
    std::fs::write(&input, anime4k_converter::formats::pth::write_pth(&expected).unwrap()).unwrap();

    let result = Command::new(env!("CARGO_BIN_EXE_convert")).arg(&input).arg(&output).output().unwrap();
    assert!(result.status.success());
    assert!(String::from_utf8(result.stdout).unwrap().starts_with("Converted .pth -> .glsl: "));
    assert_eq!(Format::Glsl.read(&output).unwrap(), expected);
}

#[test]
fn test_descriptor_include_flag() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("net.safetensors");
    let output = dir.path().join("net.comp");
    std::fs::write(&input, checkpoint::write_safetensors(&model(arch(4, 2, 1, 1, 1))).unwrap()).unwrap();

    let result = Command::new(env!("CARGO_BIN_EXE_convert"))
        .arg(&input)
        .arg(&output)
        .args(["--descriptor-include", "shaders/sets.h"])
        .output()
        .unwrap();
    assert!(result.status.success());
    assert!(std::fs::read_to_string(&output).unwrap().contains("#include \"shaders/sets.h\""));
}

#[test]
fn test_unknown_extension_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("net.safetensors");
    std::fs::write(&input, checkpoint::write_safetensors(&model(arch(4, 2, 2, 1, 1))).unwrap()).unwrap();

    let output = dir.path().join("net.txt");
    let result = convert(&[&input, &output]);
    assert_eq!(result.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&result.stderr).contains("Error: Unknown format"));
    assert!(!output.exists());

    let result = convert(&[&dir.path().join("net.bin"), &dir.path().join("net.hlsl")]);
    assert_eq!(result.status.code(), Some(1));
    assert!(!dir.path().join("net.hlsl").exists());
}

#[test]
fn test_json_output_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("net.safetensors");
    std::fs::write(&input, checkpoint::write_safetensors(&model(arch(4, 2, 2, 1, 1))).unwrap()).unwrap();

    let output = dir.path().join("net.json");
    let result = convert(&[&input, &output]);
    assert_eq!(result.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&result.stderr).contains("read-only"));
    assert!(!output.exists());
}

#[test]
fn test_failed_conversion_leaves_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("broken.hlsl");
    std::fs::write(&input, "//!MAGPIE EFFECT\n").unwrap();

    let output = dir.path().join("broken.glsl");
    let result = convert(&[&input, &output]);
    assert_eq!(result.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&result.stderr).starts_with("Error: "));
    assert!(!output.exists());
}
