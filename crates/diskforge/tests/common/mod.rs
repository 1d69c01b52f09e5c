//! Shared fixtures for integration tests.

#![allow(dead_code)]

pub use diskforge::test_support::FakeToolchain;
use diskforge::ForgeConfig;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A complete project tree in a temp dir.
pub struct Project {
    pub dir: TempDir,
}

impl Project {
    pub fn new() -> Self {
        let project = Project {
            dir: TempDir::new().unwrap(),
        };
        for layer in ["core", "alloc", "alloc_system", "collections"] {
            project.write(&format!("rust/lib{layer}/lib.rs"), &format!("// {layer}\n"));
        }
        project.write("kernel/main.rs", "fn kstart() {}\n");
        project.write("kernel/kernel.ld", "ENTRY(kstart)\n");
        project.write("programs/program.ld", "ENTRY(_start)\n");
        project.write("filesystem/etc/motd", "welcome\n");
        project.write_bytes("loader/loader.bin", &[0xEB; 64]);
        project
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root().join(relative)
    }

    pub fn write(&self, relative: &str, body: &str) {
        self.write_bytes(relative, body.as_bytes());
    }

    pub fn write_bytes(&self, relative: &str, body: &[u8]) {
        let path = self.path(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    pub fn program(&self, name: &str, body: &str) {
        self.write(&format!("programs/{name}.rs"), body);
    }

    /// Defaults rooted at the project, optionally overridden by TOML.
    pub fn config(&self, overrides: &str) -> ForgeConfig {
        ForgeConfig::parse(overrides, self.root().to_path_buf()).unwrap()
    }

    pub fn image(&self) -> PathBuf {
        self.path("build/harddrive.bin")
    }
}
