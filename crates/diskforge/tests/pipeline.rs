//! End-to-end builds against a fake toolchain.

mod common;

use common::{FakeToolchain, Project};
use diskforge::image::{inspect, DEFAULT_TABLE_OFFSET};
use diskforge::report::BuildReport;
use diskforge::{BuildError, Pipeline, Stage};

fn read_image(project: &Project) -> Vec<u8> {
    std::fs::read(project.image()).unwrap()
}

#[test]
fn test_full_build_produces_consistent_image() {
    let project = Project::new();
    project.program("hello", "fn main() {}\n");
    project.write("filesystem/.git/HEAD", "ref: main\n");
    let tc = FakeToolchain::default();

    let out = Pipeline::new(project.config(""), &tc).run().unwrap();
    let image = read_image(&project);
    let summary = inspect(&image, DEFAULT_TABLE_OFFSET).unwrap();

    // Loader region, kernel, manifest and assets account for every byte.
    let manifest_len = out.assets.manifest().encode().unwrap().len() as u64;
    assert_eq!(
        image.len() as u64,
        512 + out.kernel.len() + manifest_len + out.assets.manifest().total_size()
    );
    assert_eq!(out.image.size, image.len() as u64);
    assert_eq!(&image[..64], &[0xEB; 64][..]);
    assert_eq!(summary.kernel(&image), Some(&out.kernel.bytes[..]));

    let listing = summary.manifest.listing();
    assert_eq!(listing, "file 1,\"apps/hello.bin\"\nfile 2,\"etc/motd\"\n");
    assert_eq!(summary.asset(&image, 2), Some(&b"welcome\n"[..]));
    let hello = std::fs::read(&out.programs[0].path).unwrap();
    assert_eq!(summary.asset(&image, 1), Some(&hello[..]));

    let report = BuildReport::load(&project.path("build/i386/report.json")).unwrap();
    assert_eq!(report.image.sha256, out.image.sha256);
    assert_eq!(report.image.assets, 2);
    assert_eq!(report.stages.len(), 5);
}

#[test]
fn test_rebuild_is_byte_identical() {
    let project = Project::new();
    for name in ["shell", "editor", "clock", "calc"] {
        project.program(name, &format!("fn main() {{ /* {name} */ }}\n"));
    }
    project.write("filesystem/b/c.txt", "c");
    project.write("filesystem/a.txt", "a");
    let tc = FakeToolchain::default();

    Pipeline::new(project.config("[build]\njobs = 1\n"), &tc)
        .run()
        .unwrap();
    let first = read_image(&project);

    std::fs::remove_dir_all(project.path("build")).unwrap();
    Pipeline::new(project.config("[build]\njobs = 4\n"), &tc)
        .run()
        .unwrap();
    let second = read_image(&project);

    assert_eq!(first, second);
}

#[test]
fn test_stage_by_stage_matches_full_build() {
    let project = Project::new();
    project.program("hello", "fn main() {}\n");
    let tc = FakeToolchain::default();
    let pipeline = Pipeline::new(project.config(""), &tc);

    pipeline.run().unwrap();
    let full = read_image(&project);
    std::fs::remove_file(project.image()).unwrap();

    pipeline.build_runtime().unwrap();
    pipeline.build_kernel().unwrap();
    pipeline.build_programs(None).unwrap();
    pipeline.assemble_image().unwrap();
    assert_eq!(read_image(&project), full);
}

#[test]
fn test_runtime_is_not_rebuilt_when_fresh() {
    let project = Project::new();
    let tc = FakeToolchain::default();
    let pipeline = Pipeline::new(project.config(""), &tc);

    let first = pipeline.build_runtime().unwrap();
    assert_eq!(
        first.rebuilt,
        vec!["core", "alloc", "alloc_system", "collections"]
    );
    let second = pipeline.build_runtime().unwrap();
    assert!(second.rebuilt.is_empty());
}

#[test]
fn test_layer_without_core_is_unsatisfied() {
    let project = Project::new();
    let tc = FakeToolchain::default();
    let err = Pipeline::new(project.config(""), &tc)
        .build_runtime_layer("alloc")
        .unwrap_err();

    assert!(matches!(
        err,
        BuildError::DependencyUnsatisfied { stage: Stage::Runtime, ref dependency, .. }
            if dependency == "core"
    ));
    assert!(tc.compiled().is_empty());
}

#[test]
fn test_kernel_needs_built_runtime() {
    let project = Project::new();
    let tc = FakeToolchain::default();
    let err = Pipeline::new(project.config(""), &tc)
        .build_kernel()
        .unwrap_err();
    assert!(matches!(err, BuildError::DependencyUnsatisfied { stage: Stage::Kernel, .. }));
}

#[test]
fn test_oversized_kernel_fails_without_image() {
    let project = Project::new();
    project.write("kernel/main.rs", &"fn pad() {}\n".repeat(200));
    project.write_bytes("build/harddrive.bin", b"stale image");
    let tc = FakeToolchain::default();

    let err = Pipeline::new(project.config("[kernel]\ncapacity = 1024\n"), &tc)
        .run()
        .unwrap_err();

    assert!(matches!(
        err,
        BuildError::LayoutOverflow { stage: Stage::Kernel, ref segment, capacity: 1024, .. }
            if segment == "kernel"
    ));
    assert!(!project.image().exists());
    assert!(!project.path("build/i386/kernel/kernel.bin").exists());
}

#[test]
fn test_kernel_compile_error_leaves_no_image() {
    let project = Project::new();
    project.write("kernel/main.rs", "compile_error!(\"broken\");\n");
    project.write_bytes("build/harddrive.bin", b"stale image");
    let tc = FakeToolchain::default();

    let err = Pipeline::new(project.config(""), &tc).run().unwrap_err();
    assert!(matches!(err, BuildError::CompileError { stage: Stage::Kernel, .. }));
    assert!(!project.image().exists());
}

#[test]
fn test_failing_program_does_not_stop_others() {
    let project = Project::new();
    project.program("alpha", "fn main() {}\n");
    project.program("broken", "compile_error!(\"nope\");\n");
    project.program("gamma", "fn main() {}\n");
    let tc = FakeToolchain::default();
    let pipeline = Pipeline::new(project.config("[build]\njobs = 2\n"), &tc);
    pipeline.build_runtime().unwrap();

    let err = pipeline.build_programs(None).unwrap_err();
    assert!(matches!(
        err,
        BuildError::CompileError { stage: Stage::Programs, ref unit, .. } if unit == "broken"
    ));
    assert!(project.path("build/i386/programs/alpha/alpha.bin").exists());
    assert!(project.path("build/i386/programs/gamma/gamma.bin").exists());
    assert!(!project.path("build/i386/programs/broken/broken.bin").exists());
}

#[test]
fn test_program_link_error_is_reported() {
    let project = Project::new();
    project.program("needy", "fn main() { undefined_symbol(); }\n");
    let tc = FakeToolchain::default();

    let err = Pipeline::new(project.config(""), &tc).run().unwrap_err();
    assert!(matches!(
        err,
        BuildError::LinkError { stage: Stage::Programs, ref unit, .. } if unit == "needy"
    ));
}

#[test]
fn test_optional_program_failure_is_tolerated() {
    let project = Project::new();
    project.program("shell", "fn main() {}\n");
    project.program("game", "compile_error!(\"wip\");\n");
    let tc = FakeToolchain::default();
    let config = project.config(
        "[programs]\noptional = [\"game\"]\ntolerate_optional = true\n",
    );

    let out = Pipeline::new(config, &tc).run().unwrap();
    assert_eq!(out.report.skipped_programs, vec!["game".to_string()]);

    let summary = inspect(&read_image(&project), DEFAULT_TABLE_OFFSET).unwrap();
    assert!(summary.manifest.find("apps/shell.bin").is_some());
    assert!(summary.manifest.find("apps/game.bin").is_none());
}

#[test]
fn test_optional_failure_fails_without_tolerance() {
    let project = Project::new();
    project.program("game", "compile_error!(\"wip\");\n");
    let tc = FakeToolchain::default();
    let config = project.config("[programs]\noptional = [\"game\"]\n");

    let err = Pipeline::new(config, &tc).run().unwrap_err();
    assert!(matches!(err, BuildError::CompileError { ref unit, .. } if unit == "game"));
    assert!(!project.image().exists());
}

#[test]
fn test_installed_binary_conflicts_with_asset() {
    let project = Project::new();
    project.program("shell", "fn main() {}\n");
    project.write("filesystem/apps/shell.bin", "prebuilt");
    let tc = FakeToolchain::default();

    let err = Pipeline::new(project.config(""), &tc).run().unwrap_err();
    assert!(matches!(
        err,
        BuildError::ConflictingAsset { ref path, .. } if path == "apps/shell.bin"
    ));
}

#[test]
fn test_programs_can_skip_installing() {
    let project = Project::new();
    project.program("shell", "fn main() {}\n");
    let tc = FakeToolchain::default();

    let out = Pipeline::new(project.config("[programs]\ninstall_prefix = \"\"\n"), &tc)
        .run()
        .unwrap();
    assert_eq!(out.programs.len(), 1);
    assert_eq!(out.assets.manifest().listing(), "file 1,\"etc/motd\"\n");
}

#[test]
fn test_only_builds_named_program() {
    let project = Project::new();
    project.program("alpha", "fn main() {}\n");
    project.program("beta", "fn main() {}\n");
    let tc = FakeToolchain::default();
    let pipeline = Pipeline::new(project.config(""), &tc);
    pipeline.build_runtime().unwrap();

    let built = pipeline.build_programs(Some("beta")).unwrap();
    assert_eq!(built.len(), 1);
    assert_eq!(built[0].name, "beta");
    assert!(!project.path("build/i386/programs/alpha").exists());

    let err = pipeline.build_programs(Some("ghost")).unwrap_err();
    assert!(matches!(err, BuildError::UnknownDependency { ref dependency, .. } if dependency == "ghost"));
}

#[test]
fn test_loader_too_large_is_overflow() {
    let project = Project::new();
    project.write_bytes("loader/loader.bin", &[0x90; 600]);
    let tc = FakeToolchain::default();

    let err = Pipeline::new(project.config(""), &tc).run().unwrap_err();
    assert!(matches!(
        err,
        BuildError::LayoutOverflow { stage: Stage::Image, ref segment, .. } if segment == "loader"
    ));
    assert!(!project.image().exists());
}

fn set_mtime(path: &std::path::Path, at: std::time::SystemTime) {
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(at)
        .unwrap();
}

/// Rewrite `relative` with a modification time a minute after `than`.
fn edit_later(project: &Project, relative: &str, body: &str, than: &std::path::Path) {
    let later = std::fs::metadata(than).unwrap().modified().unwrap()
        + std::time::Duration::from_secs(60);
    project.write(relative, body);
    set_mtime(&project.path(relative), later);
}

#[test]
fn test_image_stage_rejects_stale_kernel() {
    let project = Project::new();
    let tc = FakeToolchain::default();
    let pipeline = Pipeline::new(project.config(""), &tc);
    let out = pipeline.run().unwrap();
    std::fs::remove_file(project.image()).unwrap();

    edit_later(&project, "kernel/main.rs", "fn kstart() { loop {} }\n", &out.kernel.path);

    let err = pipeline.assemble_image().unwrap_err();
    assert!(matches!(
        err,
        BuildError::DependencyUnsatisfied { stage: Stage::Kernel, ref dependency, .. }
            if dependency == "kernel"
    ));
    assert!(!project.image().exists());
}

#[test]
fn test_image_stage_rejects_stale_program() {
    let project = Project::new();
    project.program("hello", "fn main() {}\n");
    let tc = FakeToolchain::default();
    let pipeline = Pipeline::new(project.config(""), &tc);
    let out = pipeline.run().unwrap();

    edit_later(&project, "programs/hello.rs", "fn main() { exit(); }\n", &out.programs[0].path);

    let err = pipeline.assemble_image().unwrap_err();
    assert!(matches!(
        err,
        BuildError::DependencyUnsatisfied { stage: Stage::Programs, ref dependency, .. }
            if dependency == "hello"
    ));
}

#[test]
fn test_image_stage_rejects_kernel_older_than_runtime() {
    let project = Project::new();
    let tc = FakeToolchain::default();
    let pipeline = Pipeline::new(project.config(""), &tc);
    let out = pipeline.run().unwrap();

    // Source and script are older still, so only the runtime layers are newer.
    let past = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
    set_mtime(&project.path("kernel/main.rs"), past);
    set_mtime(&project.path("kernel/kernel.ld"), past);
    set_mtime(&out.kernel.path, past);

    let err = pipeline.assemble_image().unwrap_err();
    assert!(matches!(
        err,
        BuildError::DependencyUnsatisfied { stage: Stage::Kernel, ref reason, .. }
            if reason.contains("older than its inputs")
    ));
}

#[test]
fn test_program_names_become_crate_identifiers() {
    let project = Project::new();
    project.program("2048", "fn main() {}\n");
    project.program("my.app", "fn main() {}\n");
    let tc = FakeToolchain::default();

    let out = Pipeline::new(project.config(""), &tc).run().unwrap();
    let compiled = tc.compiled();
    assert!(compiled.contains(&"_2048".to_string()));
    assert!(compiled.contains(&"my_app".to_string()));

    let names: Vec<_> = out.programs.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["2048", "my.app"]);
    assert!(out.assets.manifest().find("apps/2048.bin").is_some());
}
