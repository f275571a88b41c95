//! Local Backend
//!
//! Serves the `local` context:
//! - [`LocalData`]: `local:` URIs map onto the host filesystem
//! - [`LocalExecutor`]: each map item runs the app's wrapper script in a
//!   background shell
//!
//! Every launch writes a small bash script into the step's `_log` folder,
//! next to the captured stdout/stderr of the attempt.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use chrono::Utc;
use log::{debug, warn};
use once_cell::sync::Lazy;

use super::backend::{DataBackend, ExecBackend, Invocation, ItemStatus, RunRecord};
use crate::error::BackendError;
use crate::slug::slugify;
use crate::uri::Uri;
use crate::workflow::model::{value_to_string, AppDef};

/// Name of the local context and of its data scheme.
pub const LOCAL: &str = "local";

/// Folder below a step's output holding scripts and captured output.
pub const LOG_FOLDER: &str = "_log";

/// Shell used to run generated scripts; override with `PIPEFLOW_SHELL`.
pub static SHELL: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var_os("PIPEFLOW_SHELL")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("bash"))
});

fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> BackendError {
    if source.kind() == std::io::ErrorKind::NotFound {
        return BackendError::NotFound(path.display().to_string());
    }
    BackendError::Io {
        op,
        uri: path.display().to_string(),
        source,
    }
}

/// Host filesystem storage for `local:` URIs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalData;

impl DataBackend for LocalData {
    fn scheme(&self) -> &str {
        LOCAL
    }

    fn list(&self, uri: &Uri) -> Result<Vec<String>, BackendError> {
        let path = Path::new(uri.path());
        let entries = fs::read_dir(path).map_err(|e| io_error("list", path, e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error("list", path, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn exists(&self, uri: &Uri) -> Result<bool, BackendError> {
        Ok(Path::new(uri.path()).exists())
    }

    fn mkdir(&self, uri: &Uri, recursive: bool) -> Result<(), BackendError> {
        let path = Path::new(uri.path());
        let result = if recursive {
            fs::create_dir_all(path)
        } else {
            fs::create_dir(path)
        };
        result.map_err(|e| io_error("mkdir", path, e))?;
        debug!("Created directory: {}", path.display());
        Ok(())
    }

    fn delete(&self, uri: &Uri) -> Result<(), BackendError> {
        let path = Path::new(uri.path());
        let result = if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        result.map_err(|e| io_error("delete", path, e))
    }

    fn copy(&self, src: &Uri, dest: &Uri) -> Result<(), BackendError> {
        copy_path(Path::new(src.path()), Path::new(dest.path()))
    }
}

/// Copies a file, or a directory tree merged into `dest`.
fn copy_path(src: &Path, dest: &Path) -> Result<(), BackendError> {
    if src.is_dir() {
        fs::create_dir_all(dest).map_err(|e| io_error("copy", dest, e))?;
        for entry in fs::read_dir(src).map_err(|e| io_error("copy", src, e))? {
            let entry = entry.map_err(|e| io_error("copy", src, e))?;
            copy_path(&entry.path(), &dest.join(entry.file_name()))?;
        }
        return Ok(());
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error("copy", parent, e))?;
    }
    fs::copy(src, dest).map_err(|e| io_error("copy", src, e))?;
    Ok(())
}

/// Wraps `value` in single quotes for the shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Runs app wrapper scripts as local background processes.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    retry_limit: u32,
}

impl LocalExecutor {
    pub fn new(retry_limit: u32) -> Self {
        Self { retry_limit }
    }

    /// Builds the wrapper invocation for one map item.
    ///
    /// App inputs and parameters take the item's template value, falling
    /// back to the app default. Inputs are passed as local paths and skipped
    /// when empty; `output` is placed inside the step's output folder.
    pub fn build_command(invocation: &Invocation<'_>) -> Result<String, BackendError> {
        let script = invocation
            .app
            .definition
            .local
            .as_ref()
            .map(|local| local.script.trim())
            .filter(|script| !script.is_empty())
            .ok_or_else(|| no_local_definition(invocation.step, invocation.app))?;

        let mut command = script.to_string();

        for (key, input) in &invocation.app.inputs {
            let value = invocation
                .template
                .get(key)
                .map(value_to_string)
                .unwrap_or_else(|| input.default.clone());
            if value.is_empty() {
                continue;
            }
            let path = Uri::parse(&value)?;
            command.push_str(&format!(" --{}={}", key, shell_quote(path.path())));
        }

        for (key, param) in &invocation.app.parameters {
            if key == "output" {
                continue;
            }
            let value = invocation
                .template
                .get(key)
                .unwrap_or(&param.default);
            command.push_str(&format!(" --{}={}", key, shell_quote(&value_to_string(value))));
        }

        let output = output_name(invocation);
        command.push_str(&format!(
            " --output={}",
            shell_quote(&format!("{}/{}", invocation.data_uri.path(), output))
        ));
        command.push_str(&format!(" --exec_method={}", shell_quote(invocation.method)));

        Ok(command)
    }

    /// Base path of the script and captured output of one attempt.
    fn log_base(invocation: &Invocation<'_>) -> PathBuf {
        Path::new(invocation.data_uri.path())
            .join(LOG_FOLDER)
            .join(format!(
                "gf-{}-{}-{}",
                invocation.attempt,
                slugify(invocation.step),
                slugify(&output_name(invocation))
            ))
    }
}

fn output_name(invocation: &Invocation<'_>) -> String {
    invocation
        .template
        .get("output")
        .map(value_to_string)
        .unwrap_or_default()
}

fn no_local_definition(step: &str, app: &AppDef) -> BackendError {
    BackendError::Rejected(format!(
        "step '{}': app '{}' has no local definition",
        step, app.name
    ))
}

/// Writes `command` into an executable bash script.
fn create_execution_script(path: &Path, command: &str) -> Result<(), BackendError> {
    let mut file = File::create(path).map_err(|e| io_error("write", path, e))?;
    writeln!(file, "#!/bin/bash").map_err(|e| io_error("write", path, e))?;
    writeln!(file, "set -e").map_err(|e| io_error("write", path, e))?;
    writeln!(file, "{}", command).map_err(|e| io_error("write", path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .map_err(|e| io_error("chmod", path, e))?;
    }

    Ok(())
}

impl ExecBackend for LocalExecutor {
    fn context(&self) -> &str {
        LOCAL
    }

    fn data_scheme(&self) -> &str {
        LOCAL
    }

    fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    fn validate(&self, step: &str, app: &AppDef) -> Result<(), BackendError> {
        match &app.definition.local {
            Some(local) if !local.script.trim().is_empty() => Ok(()),
            _ => Err(no_local_definition(step, app)),
        }
    }

    fn launch(&self, invocation: &Invocation<'_>) -> Result<RunRecord, BackendError> {
        let command = Self::build_command(invocation)?;
        let base = Self::log_base(invocation);
        if let Some(folder) = base.parent() {
            fs::create_dir_all(folder).map_err(|e| io_error("mkdir", folder, e))?;
        }

        let script = base.with_extension("sh");
        let stdout_path = base.with_extension("out");
        let stderr_path = base.with_extension("err");
        create_execution_script(&script, &command)?;

        let stdout = File::create(&stdout_path).map_err(|e| io_error("open", &stdout_path, e))?;
        let stderr = File::create(&stderr_path).map_err(|e| io_error("open", &stderr_path, e))?;

        debug!("Launching '{}' item '{}': {}", invocation.step, invocation.item, command);

        let child = Command::new(&*SHELL)
            .arg(&script)
            .current_dir(invocation.data_uri.path())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| io_error("spawn", &script, e))?;

        Ok(RunRecord::launched(ItemStatus::Running)
            .with_field("pid", child.id())
            .with_field("script", script.display().to_string())
            .with_field("stdout", stdout_path.display().to_string())
            .with_field("stderr", stderr_path.display().to_string())
            .with_handle(child))
    }

    fn poll(&self, run: &mut RunRecord) -> Result<ItemStatus, BackendError> {
        let child = run
            .handle_mut::<Child>()
            .ok_or_else(|| BackendError::Rejected("no process handle for this attempt".into()))?;

        let exit = child.try_wait().map_err(|source| BackendError::Io {
            op: "wait",
            uri: format!("pid {}", child.id()),
            source,
        })?;

        let Some(exit) = exit else {
            return Ok(ItemStatus::Running);
        };

        run.finished_at = Some(Utc::now());
        if let Some(code) = exit.code() {
            run.fields.insert("exit_code".to_string(), code.into());
        }

        if exit.success() {
            Ok(ItemStatus::Finished)
        } else {
            warn!("Process exited with {}", exit);
            Ok(ItemStatus::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn local(path: &Path) -> Uri {
        Uri::parse(&format!("local:{}", path.display())).unwrap()
    }

    #[test]
    fn test_local_data_operations() {
        let dir = tempdir().unwrap();
        let data = LocalData;
        let root = local(dir.path());

        let nested = root.join("a").unwrap().join("b").unwrap();
        assert!(data.mkdir(&nested, false).is_err());
        data.mkdir(&nested, true).unwrap();
        fs::write(dir.path().join("a/b/x.txt"), "x").unwrap();
        fs::write(dir.path().join("a/y.txt"), "y").unwrap();

        assert_eq!(data.list(&root.join("a").unwrap()).unwrap(), vec!["b", "y.txt"]);
        assert!(data.exists(&nested).unwrap());

        let copy = root.join("copy").unwrap();
        data.copy(&root.join("a").unwrap(), &copy).unwrap();
        assert!(dir.path().join("copy/b/x.txt").exists());

        let file_copy = root.join("single/y.txt").unwrap();
        data.copy(&root.join("a/y.txt").unwrap(), &file_copy).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("single/y.txt")).unwrap(), "y");

        data.delete(&root.join("a").unwrap()).unwrap();
        assert!(!data.exists(&root.join("a").unwrap()).unwrap());
    }

    #[test]
    fn test_list_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let missing = local(&dir.path().join("missing"));
        assert!(matches!(LocalData.list(&missing), Err(BackendError::NotFound(_))));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    fn app() -> AppDef {
        AppDef::new("bwa")
            .with_script("/apps/bwa.sh")
            .with_input("reads")
            .with_input("index")
            .with_parameter("threads", 2)
            .with_parameter("output", "")
    }

    #[test]
    fn test_build_command() {
        let app = app();
        let mut template: BTreeMap<String, Value> = BTreeMap::new();
        template.insert("reads".into(), json!("local:/data//in.fq"));
        template.insert("threads".into(), json!(8));
        template.insert("output".into(), json!("out.sam"));
        let data_uri = Uri::parse("local:/work/bwa").unwrap();

        let invocation = Invocation {
            step: "bwa",
            item: "root",
            app: &app,
            template: &template,
            data_uri: &data_uri,
            method: "auto",
            attempt: 0,
        };

        let command = LocalExecutor::build_command(&invocation).unwrap();
        assert_eq!(
            command,
            "/apps/bwa.sh --reads='/data/in.fq' --threads='8' \
             --output='/work/bwa/out.sam' --exec_method='auto'"
        );
        assert_eq!(
            LocalExecutor::log_base(&invocation),
            PathBuf::from("/work/bwa/_log/gf-0-bwa-out-sam")
        );
    }

    #[test]
    fn test_validate_requires_local_definition() {
        let executor = LocalExecutor::new(0);
        assert!(executor.validate("s", &app()).is_ok());
        assert!(executor.validate("s", &AppDef::new("remote-only")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_launch_and_poll() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("app.sh");
        fs::write(
            &script,
            "#!/bin/bash\n\
             for arg in \"$@\"; do case $arg in --output=*) out=\"${arg#--output=}\";; esac; done\n\
             echo done > \"$out\"\n",
        )
        .unwrap();

        let app = AppDef::new("touch").with_script(format!("bash {}", script.display()));
        let mut template = BTreeMap::new();
        template.insert("output".to_string(), json!("result.txt"));
        let data_uri = local(&dir.path().join("step"));
        fs::create_dir_all(dir.path().join("step")).unwrap();

        let executor = LocalExecutor::new(0);
        let invocation = Invocation {
            step: "touch",
            item: "root",
            app: &app,
            template: &template,
            data_uri: &data_uri,
            method: "auto",
            attempt: 0,
        };
        let mut run = executor.launch(&invocation).unwrap();
        assert_eq!(run.status, ItemStatus::Running);
        assert!(run.fields.contains_key("pid"));

        let deadline = Instant::now() + Duration::from_secs(10);
        let status = loop {
            let status = executor.poll(&mut run).unwrap();
            if status != ItemStatus::Running || Instant::now() > deadline {
                break status;
            }
            thread::sleep(Duration::from_millis(20));
        };

        assert_eq!(status, ItemStatus::Finished);
        assert_eq!(run.fields["exit_code"], 0);
        assert!(dir.path().join("step/result.txt").exists());
        assert!(dir.path().join("step/_log/gf-0-touch-result-txt.out").exists());
    }
}
