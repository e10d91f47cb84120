use weft_core::{DirectoryArtifact, FileArtifact, Pip, PipGraph, SealKind};

use crate::content::FileContentTable;
use crate::error::FingerprintError;
use crate::hash::{FingerprintBuilder, WeakFingerprint};

/// Hash a pip's declared surface.
///
/// Declared inputs contribute their content; declared directories contribute only a seal
/// token, so a weak miss never pays for a directory enumeration. Environment variables are
/// hashed in the order given.
pub fn compute_weak_fingerprint(
    pip: &Pip,
    graph: &PipGraph,
    content: &FileContentTable,
    salt: &str,
) -> Result<WeakFingerprint, FingerprintError> {
    let table = graph.path_table();
    let mut fp = FingerprintBuilder::new("weft.weak");
    fp.str("salt", salt);
    fp.str("exe", &table.canonical_key(pip.executable));
    fp.str("cwd", &table.canonical_key(pip.working_directory));

    fp.u64("args", pip.arguments.len() as u64);
    for arg in &pip.arguments {
        fp.str("arg", arg);
    }

    fp.u64("env", pip.environment.len() as u64);
    for (name, value) in &pip.environment {
        fp.str("env.name", name).str("env.value", value);
    }
    for name in &pip.passthrough_environment {
        fp.str("passthrough", name);
    }

    let mut inputs: Vec<(String, FileArtifact)> = pip
        .inputs
        .iter()
        .map(|input| (table.canonical_key(input.path), *input))
        .collect();
    inputs.sort();
    inputs.dedup();
    fp.u64("inputs", inputs.len() as u64);
    for (key, artifact) in &inputs {
        let hash = content.content_of(graph, *artifact)?;
        fp.str("input", key)
            .u64("rewrite", u64::from(artifact.rewrite_count))
            .digest("content", hash.as_bytes());
    }

    let mut directories: Vec<(String, [u8; 32])> = Vec::with_capacity(pip.input_directories.len());
    for dir in &pip.input_directories {
        directories.push((table.canonical_key(dir.path), seal_token(graph, *dir)?));
    }
    directories.sort();
    fp.u64("input_dirs", directories.len() as u64);
    for (key, token) in &directories {
        fp.str("input_dir", key).digest("seal", token);
    }

    let mut outputs: Vec<(String, u32)> = pip
        .outputs
        .iter()
        .map(|output| (table.canonical_key(output.path), output.rewrite_count))
        .collect();
    outputs.sort();
    fp.u64("outputs", outputs.len() as u64);
    for (key, rewrite) in &outputs {
        fp.str("output", key).u64("rewrite", u64::from(*rewrite));
    }

    let mut output_dirs: Vec<String> = pip
        .output_directories
        .iter()
        .map(|dir| table.canonical_key(dir.path))
        .collect();
    output_dirs.sort();
    for key in &output_dirs {
        fp.str("output_dir", key);
    }

    let mut success = pip.options.success_exit_codes.clone();
    success.sort_unstable();
    for code in success {
        fp.u64("success_code", code as i64 as u64);
    }
    fp.bool(
        "allow_undeclared_source_reads",
        pip.options.allow_undeclared_source_reads,
    );

    Ok(WeakFingerprint::from_digest(fp.finish()))
}

/// Identity of a directory dependency derived from its definition, not its contents.
pub fn seal_token(
    graph: &PipGraph,
    directory: DirectoryArtifact,
) -> Result<[u8; 32], FingerprintError> {
    let table = graph.path_table();
    let mut fp = FingerprintBuilder::new("weft.seal");
    fp.str("root", &table.canonical_key(directory.path));

    if !directory.is_sealed() {
        fp.str("kind", "unsealed");
        return Ok(fp.finish());
    }

    let seal = graph
        .seal(directory.seal_id)
        .ok_or(FingerprintError::UnknownSeal(directory.seal_id))?;
    fp.str("kind", seal.kind.tag());
    if let Some(producer) = seal.producer {
        fp.u64("producer", producer.to_raw());
    }
    if let SealKind::Partial { members } = &seal.kind {
        let mut keys: Vec<(String, u32)> = members
            .iter()
            .map(|member| (table.canonical_key(member.path), member.rewrite_count))
            .collect();
        keys.sort();
        for (key, rewrite) in keys {
            fp.str("member", &key).u64("rewrite", u64::from(rewrite));
        }
    }
    Ok(fp.finish())
}
