use std::sync::Arc;

use weft_cache::InMemoryCache;
use weft_core::{DirectoryArtifact, FileArtifact, PipGraph, PipId, PipOptions};
use weft_fingerprint::ContentHash;
use weft_scheduler::PipOutcome;

use crate::suite::harness::{config, run, Script, ScriptedExecutor, Step, Workspace};

fn executed(outcome: Option<&PipOutcome>) -> bool {
    matches!(outcome, Some(PipOutcome::Executed { .. }))
}

fn hit(outcome: Option<&PipOutcome>) -> bool {
    matches!(outcome, Some(PipOutcome::CacheHit))
}

struct CompileLink {
    graph: Arc<PipGraph>,
    compile: PipId,
    link: PipId,
    docs: PipId,
}

fn compile_link(workspace: &Workspace) -> CompileLink {
    let mut g = workspace.graph();
    let compile = g
        .pip("compile")
        .input(g.source("src/main.c"))
        .output(g.output("out/main.o"));
    let compile = g.add(compile);
    let link = g
        .pip("link")
        .input(g.output("out/main.o"))
        .output(g.output("out/app"));
    let link = g.add(link);
    let docs = g
        .pip("docs")
        .input(g.source("src/readme.md"))
        .output(g.output("out/readme.html"));
    let docs = g.add(docs);
    CompileLink {
        graph: g.build(),
        compile,
        link,
        docs,
    }
}

fn compile_link_scripts(executor: &ScriptedExecutor) {
    executor.script(
        "compile",
        Script::new(vec![Step::Read("src/main.c"), Step::Write("out/main.o")]),
    );
    executor.script(
        "link",
        Script::new(vec![Step::Read("out/main.o"), Step::Write("out/app")]),
    );
    executor.script(
        "docs",
        Script::new(vec![Step::Read("src/readme.md"), Step::Write("out/readme.html")]),
    );
}

#[tokio::test]
async fn unchanged_graph_is_served_from_cache() {
    let workspace = Workspace::new();
    workspace.write("src/main.c", "int main() {}");
    workspace.write("src/readme.md", "# app");
    let executor = ScriptedExecutor::new(&workspace);
    compile_link_scripts(&executor);
    let cache = Arc::new(InMemoryCache::new());

    let first = compile_link(&workspace);
    let report = run(first.graph, config(), &cache, &executor).await;
    assert!(report.success(), "{report:?}");
    assert_eq!(report.counters.executed, 3);
    assert_eq!(report.counters.stored, 3);
    assert_eq!(cache.entry_count(), 3);
    let app = workspace.read("out/app");
    assert_eq!(app, "link\ncompile\nint main() {}");

    // A new session re-creates the graph over a fresh path table.
    let second = compile_link(&workspace);
    assert_eq!(second.compile, first.compile);
    let report = run(second.graph, config(), &cache, &executor).await;
    assert!(report.success(), "{report:?}");
    assert_eq!(report.counters.cache_hits, 3);
    assert_eq!(report.counters.executed, 0);
    assert_eq!(report.counters.replayed_files, 0);
    assert_eq!(executor.starts().len(), 3);
    assert_eq!(workspace.read("out/app"), app);
}

#[tokio::test]
async fn editing_a_source_reruns_only_its_consumers() {
    let workspace = Workspace::new();
    workspace.write("src/main.c", "int main() {}");
    workspace.write("src/readme.md", "# app");
    let executor = ScriptedExecutor::new(&workspace);
    compile_link_scripts(&executor);
    let cache = Arc::new(InMemoryCache::new());

    let report = run(compile_link(&workspace).graph, config(), &cache, &executor).await;
    assert!(report.success(), "{report:?}");

    workspace.write("src/main.c", "int main() { return 1; }");
    executor.clear_starts();
    let graph = compile_link(&workspace);
    let report = run(graph.graph, config(), &cache, &executor).await;
    assert!(report.success(), "{report:?}");
    assert!(executed(report.outcome(graph.compile)));
    assert!(executed(report.outcome(graph.link)));
    assert!(hit(report.outcome(graph.docs)));
    assert_eq!(executor.starts().len(), 2);
    assert!(workspace.read("out/app").contains("return 1"));
}

fn env_graph(workspace: &Workspace, env: &[(&str, &str)], flag: &str) -> (Arc<PipGraph>, PipId) {
    let mut g = workspace.graph();
    let mut pip = g.pip("env").arg(flag).output(g.output("out/env.txt"));
    for (name, value) in env {
        pip = pip.env(*name, *value);
    }
    let id = g.add(pip);
    (g.build(), id)
}

#[tokio::test]
async fn environment_order_and_arguments_are_fingerprinted() {
    let workspace = Workspace::new();
    let executor = ScriptedExecutor::new(&workspace);
    executor.script("env", Script::new(vec![Step::Write("out/env.txt")]));
    let cache = Arc::new(InMemoryCache::new());

    let (graph, original) = env_graph(&workspace, &[("A", "1"), ("B", "2")], "-O2");
    let report = run(graph, config(), &cache, &executor).await;
    assert!(executed(report.outcome(original)));

    // Same pip identity, different fingerprint.
    let (graph, reordered) = env_graph(&workspace, &[("B", "2"), ("A", "1")], "-O2");
    assert_eq!(reordered, original);
    let report = run(graph, config(), &cache, &executor).await;
    assert!(executed(report.outcome(reordered)));
    assert_eq!(report.counters.cache_misses, 1);

    let (graph, restored) = env_graph(&workspace, &[("A", "1"), ("B", "2")], "-O2");
    let report = run(graph, config(), &cache, &executor).await;
    assert!(hit(report.outcome(restored)));

    let (graph, changed) = env_graph(&workspace, &[("A", "1"), ("B", "2")], "-O0");
    assert_ne!(changed, original);
    let report = run(graph, config(), &cache, &executor).await;
    assert!(executed(report.outcome(changed)));
    assert_eq!(executor.start_count("env"), 3);
}

fn probe_graph(workspace: &Workspace) -> (Arc<PipGraph>, PipId) {
    let mut g = workspace.graph();
    let pip = g.pip("probe").output(g.output("out/probe.out")).options(PipOptions {
        allow_undeclared_source_reads: true,
        ..PipOptions::default()
    });
    let id = g.add(pip);
    (g.build(), id)
}

#[tokio::test]
async fn absent_reads_are_invalidated_when_the_file_appears() {
    let workspace = Workspace::new();
    let executor = ScriptedExecutor::new(&workspace);
    executor.script(
        "probe",
        Script::new(vec![Step::Read("src/probe.txt"), Step::Write("out/probe.out")]),
    );
    let cache = Arc::new(InMemoryCache::new());

    let (graph, id) = probe_graph(&workspace);
    let report = run(graph, config(), &cache, &executor).await;
    assert!(executed(report.outcome(id)), "{report:?}");
    let absent = workspace.read("out/probe.out");
    assert_eq!(absent, "probe\n<absent>");

    let report = run(probe_graph(&workspace).0, config(), &cache, &executor).await;
    assert!(hit(report.outcome(id)));

    workspace.write("src/probe.txt", "v1");
    let report = run(probe_graph(&workspace).0, config(), &cache, &executor).await;
    assert!(executed(report.outcome(id)), "{report:?}");
    assert_eq!(workspace.read("out/probe.out"), "probe\nv1");

    let report = run(probe_graph(&workspace).0, config(), &cache, &executor).await;
    assert!(hit(report.outcome(id)));

    workspace.write("src/probe.txt", "v2");
    let report = run(probe_graph(&workspace).0, config(), &cache, &executor).await;
    assert!(executed(report.outcome(id)));
    assert_eq!(workspace.read("out/probe.out"), "probe\nv2");

    // Deleting it again matches the first entry.
    workspace.remove("src/probe.txt");
    let report = run(probe_graph(&workspace).0, config(), &cache, &executor).await;
    assert!(hit(report.outcome(id)), "{report:?}");
    assert_eq!(report.counters.replayed_files, 1);
    assert_eq!(workspace.read("out/probe.out"), absent);
    assert_eq!(executor.start_count("probe"), 3);
}

fn lister_graph(workspace: &Workspace) -> (Arc<PipGraph>, PipId) {
    let mut g = workspace.graph();
    let pip = g.pip("lister").output(g.output("out/headers.txt"));
    let id = g.add(pip);
    (g.build(), id)
}

#[tokio::test]
async fn read_only_enumerations_track_matching_names_on_disk() {
    let workspace = Workspace::new();
    workspace.write("src/include/a.h", "");
    let executor = ScriptedExecutor::new(&workspace);
    executor.script(
        "lister",
        Script::new(vec![
            Step::Enumerate("src/include", "*.h"),
            Step::Write("out/headers.txt"),
        ]),
    );
    let cache = Arc::new(InMemoryCache::new());

    let (graph, id) = lister_graph(&workspace);
    let report = run(graph, config(), &cache, &executor).await;
    assert!(executed(report.outcome(id)), "{report:?}");

    workspace.write("src/include/notes.txt", "not a header");
    let report = run(lister_graph(&workspace).0, config(), &cache, &executor).await;
    assert!(hit(report.outcome(id)));

    workspace.write("src/include/b.h", "");
    let report = run(lister_graph(&workspace).0, config(), &cache, &executor).await;
    assert!(executed(report.outcome(id)));
    assert_eq!(
        workspace.read("out/headers.txt"),
        "lister\nls src/include: a.h,b.h"
    );
}

fn gen_pack_graph(workspace: &Workspace) -> (Arc<PipGraph>, PipId, PipId) {
    let mut g = workspace.graph();
    let generate = g.pip("gen").output(g.output("out/gen/x.o"));
    let generate = g.add(generate);
    let pack = g
        .pip("pack")
        .input(g.output("out/gen/x.o"))
        .output(g.output("out/pack.txt"));
    let pack = g.add(pack);
    (g.build(), generate, pack)
}

#[tokio::test]
async fn output_mount_enumerations_use_graph_membership() {
    let workspace = Workspace::new();
    let executor = ScriptedExecutor::new(&workspace);
    executor.script("gen", Script::new(vec![Step::Write("out/gen/x.o")]));
    executor.script(
        "pack",
        Script::new(vec![
            Step::Enumerate("out/gen", "*"),
            Step::Read("out/gen/x.o"),
            Step::Write("out/pack.txt"),
        ]),
    );
    let cache = Arc::new(InMemoryCache::new());

    let (graph, generate, pack) = gen_pack_graph(&workspace);
    let report = run(graph, config(), &cache, &executor).await;
    assert!(report.success(), "{report:?}");
    assert!(executed(report.outcome(pack)));

    // Stray files and deleted outputs do not change what the graph says lives there.
    workspace.write("out/gen/stray.o", "junk");
    workspace.remove("out/gen/x.o");
    let report = run(gen_pack_graph(&workspace).0, config(), &cache, &executor).await;
    assert!(hit(report.outcome(generate)), "{report:?}");
    assert!(hit(report.outcome(pack)), "{report:?}");
    assert_eq!(report.counters.replayed_files, 1);
    assert!(workspace.exists("out/gen/x.o"));
}

struct Chain {
    graph: Arc<PipGraph>,
    stages: [PipId; 3],
}

fn chain_graph(workspace: &Workspace) -> Chain {
    let mut g = workspace.graph();
    let v1 = FileArtifact::output(g.path("out/chain.txt"));
    let v2 = v1.next_rewrite();
    let v3 = v2.next_rewrite();
    let first = g.pip("stage1").input(g.source("src/s1.txt")).output(v1);
    let first = g.add(first);
    let second = g
        .pip("stage2")
        .input(v1)
        .input(g.source("src/s2.txt"))
        .output(v2);
    let second = g.add(second);
    let third = g
        .pip("stage3")
        .input(v2)
        .input(g.source("src/s3.txt"))
        .output(v3);
    let third = g.add(third);
    Chain {
        graph: g.build(),
        stages: [first, second, third],
    }
}

#[tokio::test]
async fn rewrite_chains_replay_every_version() {
    let workspace = Workspace::new();
    for (name, text) in [("s1", "one"), ("s2", "two"), ("s3", "three")] {
        workspace.write(&format!("src/{name}.txt"), text);
    }
    let executor = ScriptedExecutor::new(&workspace);
    executor.script(
        "stage1",
        Script::new(vec![Step::Read("src/s1.txt"), Step::Write("out/chain.txt")]),
    );
    for (stage, source) in [("stage2", "src/s2.txt"), ("stage3", "src/s3.txt")] {
        executor.script(
            stage,
            Script::new(vec![
                Step::Read("out/chain.txt"),
                Step::Read(source),
                Step::Write("out/chain.txt"),
            ]),
        );
    }
    let cache = Arc::new(InMemoryCache::new());

    let report = run(chain_graph(&workspace).graph, config(), &cache, &executor).await;
    assert!(report.success(), "{report:?}");
    assert_eq!(report.counters.executed, 3);
    let final_text = workspace.read("out/chain.txt");
    assert_eq!(final_text, "stage3\nstage2\nstage1\none\ntwo\nthree");

    // Each replay puts its own version on disk before the next stage's replay.
    let report = run(chain_graph(&workspace).graph, config(), &cache, &executor).await;
    assert_eq!(report.counters.cache_hits, 3, "{report:?}");
    assert_eq!(report.counters.replayed_files, 3);
    assert_eq!(workspace.read("out/chain.txt"), final_text);

    workspace.write("src/s2.txt", "TWO");
    let chain = chain_graph(&workspace);
    let report = run(chain.graph, config(), &cache, &executor).await;
    assert!(report.success(), "{report:?}");
    assert!(hit(report.outcome(chain.stages[0])));
    assert!(executed(report.outcome(chain.stages[1])));
    assert!(executed(report.outcome(chain.stages[2])));
    assert_eq!(
        workspace.read("out/chain.txt"),
        "stage3\nstage2\nstage1\none\nTWO\nthree"
    );
}

fn emit_graph(workspace: &Workspace) -> (Arc<PipGraph>, PipId) {
    let mut g = workspace.graph();
    let pip = g
        .pip("emit")
        .input(g.source("src/in.txt"))
        .output(g.output("out/emit.txt"));
    let id = g.add(pip);
    (g.build(), id)
}

#[tokio::test]
async fn replay_restores_tampered_outputs_and_rejects_corrupt_blobs() {
    let workspace = Workspace::new();
    workspace.write("src/in.txt", "payload");
    let executor = ScriptedExecutor::new(&workspace);
    executor.script(
        "emit",
        Script::new(vec![Step::Read("src/in.txt"), Step::Write("out/emit.txt")]),
    );
    let cache = Arc::new(InMemoryCache::new());

    let (graph, id) = emit_graph(&workspace);
    run(graph, config(), &cache, &executor).await;
    let original = workspace.read("out/emit.txt");

    workspace.write("out/emit.txt", "tampered");
    let report = run(emit_graph(&workspace).0, config(), &cache, &executor).await;
    assert!(hit(report.outcome(id)));
    assert_eq!(report.counters.replayed_files, 1);
    assert_eq!(workspace.read("out/emit.txt"), original);

    cache.corrupt_blob(ContentHash::of(original.as_bytes()), b"garbage");
    workspace.remove("out/emit.txt");
    let report = run(emit_graph(&workspace).0, config(), &cache, &executor).await;
    assert!(executed(report.outcome(id)), "{report:?}");
    assert_eq!(report.counters.cache_misses, 1);
    assert_eq!(workspace.read("out/emit.txt"), original);
    assert_eq!(executor.start_count("emit"), 2);

    // Re-execution stored the good bytes again, so the entry is usable once more.
    workspace.remove("out/emit.txt");
    let report = run(emit_graph(&workspace).0, config(), &cache, &executor).await;
    assert!(hit(report.outcome(id)), "{report:?}");
    assert_eq!(workspace.read("out/emit.txt"), original);
    assert_eq!(executor.start_count("emit"), 2);
}

fn opaque_graph(workspace: &Workspace) -> (Arc<PipGraph>, PipId) {
    let mut g = workspace.graph();
    let pip = g.pip("unpack").output_directory(g.path("out/unpacked"));
    let id = g.add(pip);
    (g.build(), id)
}

#[tokio::test]
async fn replaying_an_opaque_directory_removes_stale_files() {
    let workspace = Workspace::new();
    let executor = ScriptedExecutor::new(&workspace);
    executor.script(
        "unpack",
        Script::new(vec![
            Step::Write("out/unpacked/a.txt"),
            Step::Write("out/unpacked/nested/b.txt"),
        ]),
    );
    let cache = Arc::new(InMemoryCache::new());

    let (graph, id) = opaque_graph(&workspace);
    let report = run(graph, config(), &cache, &executor).await;
    assert!(executed(report.outcome(id)), "{report:?}");
    let a = workspace.read("out/unpacked/a.txt");

    workspace.write("out/unpacked/stale.txt", "left over");
    workspace.write("out/unpacked/nested/old.txt", "left over");
    workspace.remove("out/unpacked/a.txt");
    let report = run(opaque_graph(&workspace).0, config(), &cache, &executor).await;
    assert!(hit(report.outcome(id)), "{report:?}");
    assert_eq!(report.counters.replayed_files, 1);
    assert_eq!(workspace.read("out/unpacked/a.txt"), a);
    assert!(workspace.exists("out/unpacked/nested/b.txt"));
    assert!(!workspace.exists("out/unpacked/stale.txt"));
    assert!(!workspace.exists("out/unpacked/nested/old.txt"));
    assert_eq!(executor.start_count("unpack"), 1);
}

#[tokio::test]
async fn tolerated_violations_run_but_are_never_cached() {
    let workspace = Workspace::new();
    workspace.write("src/secret.txt", "hidden");
    let executor = ScriptedExecutor::new(&workspace);
    executor.script(
        "sneaky",
        Script::new(vec![Step::Read("src/secret.txt"), Step::Write("out/sneaky.txt")]),
    );
    let cache = Arc::new(InMemoryCache::new());
    let mut lenient = config();
    lenient.observation.unexpected_file_accesses_are_errors = false;

    let graph = || {
        let mut g = workspace.graph();
        let pip = g.pip("sneaky").output(g.output("out/sneaky.txt"));
        let id = g.add(pip);
        (g.build(), id)
    };

    let (first, id) = graph();
    let report = run(first, lenient.clone(), &cache, &executor).await;
    assert!(
        matches!(
            report.outcome(id),
            Some(PipOutcome::Executed { stored: false, .. })
        ),
        "{report:?}"
    );
    assert_eq!(report.counters.uncacheable, 1);
    assert_eq!(cache.entry_count(), 0);

    let report = run(graph().0, lenient, &cache, &executor).await;
    assert!(executed(report.outcome(id)));
    assert_eq!(executor.start_count("sneaky"), 2);
}

#[tokio::test]
async fn probes_track_existence_not_content() {
    let workspace = Workspace::new();
    workspace.write("src/feature.flag", "on");
    let executor = ScriptedExecutor::new(&workspace);
    executor.script(
        "probe",
        Script::new(vec![Step::Probe("src/feature.flag"), Step::Write("out/probe.out")]),
    );
    let cache = Arc::new(InMemoryCache::new());

    let (graph, id) = probe_graph(&workspace);
    let report = run(graph, config(), &cache, &executor).await;
    assert!(executed(report.outcome(id)), "{report:?}");

    workspace.write("src/feature.flag", "off");
    let report = run(probe_graph(&workspace).0, config(), &cache, &executor).await;
    assert!(hit(report.outcome(id)), "{report:?}");

    workspace.remove("src/feature.flag");
    let report = run(probe_graph(&workspace).0, config(), &cache, &executor).await;
    assert!(executed(report.outcome(id)), "{report:?}");
    assert_eq!(
        workspace.read("out/probe.out"),
        "probe\nprobe src/feature.flag: false"
    );
}

fn configure_graph(workspace: &Workspace) -> (Arc<PipGraph>, PipId) {
    let mut g = workspace.graph();
    let generated = DirectoryArtifact::unsealed(g.path("out/gen"));
    let pip = g
        .pip("configure")
        .input_directory(generated)
        .output(g.output("out/configure.log"));
    let id = g.add(pip);
    (g.build(), id)
}

#[tokio::test]
async fn absent_outputs_track_content_after_they_appear() {
    let workspace = Workspace::new();
    let executor = ScriptedExecutor::new(&workspace);
    executor.script(
        "configure",
        Script::new(vec![
            Step::Probe("out/gen/config.h"),
            Step::Write("out/configure.log"),
        ]),
    );
    let cache = Arc::new(InMemoryCache::new());

    let (graph, id) = configure_graph(&workspace);
    let report = run(graph, config(), &cache, &executor).await;
    assert!(executed(report.outcome(id)), "{report:?}");
    assert_eq!(report.counters.stored, 1, "{report:?}");

    workspace.write("out/gen/config.h", "v1");
    let report = run(configure_graph(&workspace).0, config(), &cache, &executor).await;
    assert!(executed(report.outcome(id)), "{report:?}");

    let report = run(configure_graph(&workspace).0, config(), &cache, &executor).await;
    assert!(hit(report.outcome(id)), "{report:?}");

    // Same existence, different bytes.
    workspace.write("out/gen/config.h", "v2 different");
    let report = run(configure_graph(&workspace).0, config(), &cache, &executor).await;
    assert!(executed(report.outcome(id)), "{report:?}");
    assert_eq!(executor.start_count("configure"), 3);
}
