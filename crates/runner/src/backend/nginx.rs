//! Process manager pools behind one shared reverse proxy
//!
//! Each scenario gets its own php-fpm pool listening on a unix socket and an
//! nginx site on the scenario's server port that forwards to that socket.
//! nginx itself is started once for the whole run.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{info, warn};

use super::{clear_dir, ensure_dir, remove_file_if_exists, Backend, BackendKind};
use crate::config::FpmProxyConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::process::{self, ProcessHandle, ProcessMatch};
use crate::scenario::PreparedScenario;

const INCLUDE_LINE: &str = "include /etc/nginx/conf.d/*.conf;";

pub struct NginxPhpFpmBackend {
    cfg: FpmProxyConfig,
    poll: Duration,
    generated: Mutex<Vec<PathBuf>>,
}

impl NginxPhpFpmBackend {
    pub fn new(cfg: FpmProxyConfig, poll: Duration) -> Self {
        Self {
            cfg,
            poll,
            generated: Mutex::new(Vec::new()),
        }
    }

    fn socket_path(&self, name: &str) -> PathBuf {
        self.cfg.socket_dir.join(format!("php-fpm-{}.sock", name))
    }

    fn proxy_process_name(&self) -> String {
        process::process_name(&self.cfg.nginx_binary)
    }

    pub fn site_config(&self, scenario: &PreparedScenario) -> String {
        format!(
            r#"
server {{
    listen {port};
    server_name {name};

    root {root};
    index index.php;

    location / {{
        try_files $uri $uri/ /index.php?$args;
    }}

    location ~ \.php$ {{
        fastcgi_split_path_info ^(.+\.php)(/.+)$;
        fastcgi_pass unix:{socket};
        fastcgi_param SCRIPT_FILENAME $document_root$fastcgi_script_name;
        fastcgi_index index.php;
        include fastcgi.conf;
    }}
}}
"#,
            port = scenario.server_port(),
            name = scenario.name(),
            root = scenario.spec.dir.display(),
            socket = self.socket_path(scenario.name()).display(),
        )
    }

    pub fn pool_config(&self, scenario: &PreparedScenario) -> String {
        let name = scenario.name();
        let user = &self.cfg.run_as;
        format!(
            r#"[{name}]
user = {user}
group = {user}
listen = {socket}
listen.owner = {user}
listen.group = {user}
pm = dynamic
pm.max_children = 5
pm.start_servers = 2
pm.min_spare_servers = 1
pm.max_spare_servers = 3
clear_env = no
catch_workers_output = yes
access.log = {log_dir}/access-{name}.log

php_admin_value[error_log] = {log_dir}/error-{name}.log
php_admin_flag[log_errors] = on
"#,
            socket = self.socket_path(name).display(),
            log_dir = self.cfg.fpm_log_dir.display(),
        )
    }

    fn write_generated(&self, path: &Path, content: &str) -> HarnessResult<()> {
        std::fs::write(path, content)?;
        self.generated.lock().push(path.to_path_buf());
        Ok(())
    }

    fn patch_proxy_config(&self) -> HarnessResult<()> {
        let path = &self.cfg.nginx_conf;
        if !path.exists() {
            warn!("{} not found, leaving proxy config untouched", path.display());
            return Ok(());
        }
        let content = std::fs::read_to_string(path)?;
        let patched = switch_worker_user(&enable_config_line(&content, INCLUDE_LINE), &self.cfg.run_as);
        if patched != content {
            std::fs::write(path, patched)?;
            info!("Patched {}", path.display());
        }
        Ok(())
    }

    fn preflight_error(&self, reason: impl Into<String>) -> HarnessError {
        HarnessError::PreflightFailed {
            backend: self.kind().to_string(),
            reason: reason.into(),
        }
    }
}

/// Uncomment `line` if it appears commented out with `#`.
pub fn enable_config_line(content: &str, line: &str) -> String {
    let target = line.trim();
    let mut out = String::with_capacity(content.len());
    for current in content.split_inclusive('\n') {
        let uncommented = current
            .trim_start()
            .strip_prefix('#')
            .filter(|rest| rest.trim() == target);
        match uncommented {
            Some(_) => {
                out.push_str(target);
                if current.ends_with('\n') {
                    out.push('\n');
                }
            }
            None => out.push_str(current),
        }
    }
    out
}

/// Point the proxy's worker `user` directive at `user`.
pub fn switch_worker_user(content: &str, user: &str) -> String {
    let directive = format!("user {};", user);
    content
        .replace("user nginx;", &directive)
        .replace("user www-data;", &directive)
}

#[async_trait]
impl Backend for NginxPhpFpmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::NginxPhpFpm
    }

    async fn initialize(&self, _tests_root: &Path) -> HarnessResult<()> {
        ensure_dir(&self.cfg.socket_dir)?;
        ensure_dir(&self.cfg.fpm_log_dir)?;
        ensure_dir(&self.cfg.pool_dir)?;
        ensure_dir(&self.cfg.site_dir)?;
        self.patch_proxy_config()
    }

    fn process_scenario(&self, mut scenario: PreparedScenario) -> HarnessResult<PreparedScenario> {
        let site = self.site_config(&scenario);
        let site_path = self.cfg.site_dir.join(format!("{}.conf", scenario.name()));
        self.write_generated(&site_path, &site)?;

        let pool_path = self.cfg.pool_dir.join(format!("{}.conf", scenario.name()));
        self.write_generated(&pool_path, &self.pool_config(&scenario))?;

        info!("Configured nginx site and php-fpm pool for {}", scenario.name());
        scenario.artifacts.site_block = Some(site);
        scenario.artifacts.pool_config = Some(pool_path);
        Ok(scenario)
    }

    async fn pre_flight(&self, scenarios: &[PreparedScenario]) -> HarnessResult<()> {
        let proxy = self.proxy_process_name();
        process::kill_processes(&proxy, ProcessMatch::Name, false).await;
        process::kill_processes(&process::process_name(&self.cfg.fpm_binary), ProcessMatch::Name, false).await;

        for dir in [&self.cfg.nginx_log_dir, &self.cfg.fpm_log_dir] {
            if let Err(e) = clear_dir(dir) {
                warn!("Could not clear {}: {}", dir.display(), e);
            }
        }
        ensure_dir(&self.cfg.socket_dir)?;
        ensure_dir(&self.cfg.fpm_log_dir)?;

        let status = Command::new(&self.cfg.nginx_binary)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| self.preflight_error(format!("could not run {}: {}", self.cfg.nginx_binary, e)))?;
        if !status.success() {
            return Err(self.preflight_error(format!("{} exited with {}", self.cfg.nginx_binary, status)));
        }

        let budget = Duration::from_millis(self.cfg.startup_wait_ms);
        if !process::wait_for_process(&proxy, budget, self.poll).await {
            return Err(self.preflight_error(format!("{} not running after {:?}", proxy, budget)));
        }

        info!("nginx started for {} scenario(s)", scenarios.len());
        Ok(())
    }

    async fn start_server(
        &self,
        scenario: &PreparedScenario,
        _lib_dir: &Path,
        _memory_checker: bool,
    ) -> HarnessResult<Option<ProcessHandle>> {
        let pool = scenario.artifacts.pool_config.as_ref().ok_or_else(|| {
            HarnessError::Backend(format!("no php-fpm pool generated for {}", scenario.name()))
        })?;

        let mut cmd = Command::new(&self.cfg.fpm_binary);
        cmd.args(["--force-stderr", "--nodaemonize", "--allow-to-run-as-root", "--fpm-config"])
            .arg(pool)
            .envs(&scenario.env)
            .stdin(Stdio::null());

        ProcessHandle::spawn(format!("php-fpm pool for {}", scenario.name()), &mut cmd).map(Some)
    }

    async fn teardown(&self) -> HarnessResult<()> {
        process::kill_processes(&self.proxy_process_name(), ProcessMatch::Name, false).await;

        let generated = std::mem::take(&mut *self.generated.lock());
        for path in generated {
            remove_file_if_exists(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortAllocator;
    use crate::scenario::{ScenarioArtifacts, ScenarioSpec};
    use std::collections::BTreeMap;
    use test_case::test_case;

    fn config_in(root: &Path) -> FpmProxyConfig {
        FpmProxyConfig {
            nginx_binary: "hproxy-absent".to_string(),
            fpm_binary: root.join("hfpm-absent"),
            nginx_conf: root.join("nginx.conf"),
            site_dir: root.join("conf.d"),
            pool_dir: root.join("pools"),
            socket_dir: root.join("run"),
            fpm_log_dir: root.join("log/php-fpm"),
            nginx_log_dir: root.join("log/nginx"),
            startup_wait_ms: 200,
            ..FpmProxyConfig::default()
        }
    }

    fn backend_in(root: &Path) -> NginxPhpFpmBackend {
        NginxPhpFpmBackend::new(config_in(root), Duration::from_millis(10))
    }

    fn stub_binary(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_enable_config_line() {
        let content = "http {\n    # include /etc/nginx/conf.d/*.conf;\n    sendfile on;\n}\n";
        let patched = enable_config_line(content, INCLUDE_LINE);
        assert_eq!(
            patched,
            "http {\ninclude /etc/nginx/conf.d/*.conf;\n    sendfile on;\n}\n"
        );
        // Already enabled: unchanged
        assert_eq!(enable_config_line(&patched, INCLUDE_LINE), patched);
    }

    #[test]
    fn test_switch_worker_user() {
        assert_eq!(switch_worker_user("user www-data;\n", "root"), "user root;\n");
        assert_eq!(switch_worker_user("user nginx;\n", "root"), "user root;\n");
        assert_eq!(switch_worker_user("user root;\n", "root"), "user root;\n");
    }

    #[tokio::test]
    async fn test_initialize_and_process_scenario() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("nginx.conf"), "user nginx;\n#include /etc/nginx/conf.d/*.conf;\n").unwrap();
        let scenario_dir = root.path().join("test_shell_injection");
        std::fs::create_dir(&scenario_dir).unwrap();

        let backend = backend_in(root.path());
        backend.initialize(root.path()).await.unwrap();
        let nginx_conf = std::fs::read_to_string(root.path().join("nginx.conf")).unwrap();
        assert_eq!(nginx_conf, "user root;\ninclude /etc/nginx/conf.d/*.conf;\n");

        let scenario = PreparedScenario {
            spec: ScenarioSpec::from_dir(&scenario_dir, BackendKind::NginxPhpFpm).unwrap(),
            ports: PortAllocator::new().allocate_pair(),
            env: BTreeMap::new(),
            artifacts: ScenarioArtifacts::default(),
        };
        let port = scenario.server_port();
        let scenario = backend.process_scenario(scenario).unwrap();

        let site = std::fs::read_to_string(root.path().join("conf.d/test_shell_injection.conf")).unwrap();
        assert!(site.contains(&format!("listen {};", port)));
        assert!(site.contains("php-fpm-test_shell_injection.sock"));
        assert_eq!(scenario.artifacts.site_block.as_deref(), Some(site.as_str()));

        let pool_path = scenario.artifacts.pool_config.clone().unwrap();
        let pool = std::fs::read_to_string(&pool_path).unwrap();
        assert!(pool.starts_with("[test_shell_injection]\nuser = root\n"));
        assert!(pool.contains("clear_env = no"));

        backend.teardown().await.unwrap();
        assert!(!pool_path.exists());
        assert!(!root.path().join("conf.d/test_shell_injection.conf").exists());
    }

    #[test_case("exit 0", "not running" ; "proxy exits without staying up")]
    #[test_case("exit 1", "exited with" ; "proxy refuses to start")]
    #[tokio::test]
    async fn test_pre_flight_fails_without_proxy(body: &str, expected: &str) {
        let root = tempfile::tempdir().unwrap();
        let proxy = stub_binary(root.path(), "hproxy-stub", body);
        let backend = NginxPhpFpmBackend::new(
            FpmProxyConfig {
                nginx_binary: proxy.display().to_string(),
                ..config_in(root.path())
            },
            Duration::from_millis(10),
        );

        match backend.pre_flight(&[]).await {
            Err(HarnessError::PreflightFailed { backend, reason }) => {
                assert_eq!(backend, "nginx-php-fpm");
                assert!(reason.contains(expected), "{}", reason);
            }
            other => panic!("expected pre-flight failure, got {:?}", other.map(|_| ())),
        }
    }
}
