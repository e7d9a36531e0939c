//! Built-in interpreter server: a fresh `php -S` per scenario

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{Backend, BackendKind};
use crate::config::BuiltInConfig;
use crate::error::HarnessResult;
use crate::process::ProcessHandle;
use crate::scenario::PreparedScenario;

pub struct PhpBuiltInBackend {
    cfg: BuiltInConfig,
}

impl PhpBuiltInBackend {
    pub fn new(cfg: BuiltInConfig) -> Self {
        Self { cfg }
    }

    /// Program and arguments serving `scenario`, optionally under the memory
    /// checker.
    pub fn server_argv(
        &self,
        scenario: &PreparedScenario,
        lib_dir: &Path,
        memory_checker: bool,
    ) -> Vec<String> {
        let mut argv = Vec::new();
        if memory_checker {
            argv.push(self.cfg.memory_checker.clone());
            argv.push(format!(
                "--suppressions={}",
                lib_dir.join(&self.cfg.suppressions_file).display()
            ));
            argv.push("--track-origins=yes".to_string());
        }
        argv.push(self.cfg.php_binary.clone());
        argv.push("-S".to_string());
        argv.push(format!("{}:{}", self.cfg.bind_host, scenario.server_port()));
        argv.push("-t".to_string());
        argv.push(scenario.spec.dir.to_string_lossy().to_string());
        argv
    }
}

#[async_trait]
impl Backend for PhpBuiltInBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::PhpBuiltIn
    }

    async fn start_server(
        &self,
        scenario: &PreparedScenario,
        lib_dir: &Path,
        memory_checker: bool,
    ) -> HarnessResult<Option<ProcessHandle>> {
        let argv = self.server_argv(scenario, lib_dir, memory_checker);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .envs(&scenario.env)
            .stdin(Stdio::null());

        let label = format!("php server for {} on port {}", scenario.name(), scenario.server_port());
        ProcessHandle::spawn(label, &mut cmd).map(Some)
    }
}
