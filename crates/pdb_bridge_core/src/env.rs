//! Locates the project a target file belongs to and decides which interpreter
//! (or project tool) the debugger is launched under.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::{DebugError, Result};

const PROJECT_MARKERS: &[&str] = &[
    "pyproject.toml",
    "setup.py",
    "setup.cfg",
    "requirements.txt",
    "Pipfile",
    ".git",
];
const PROJECT_DESCRIPTOR: &str = "pyproject.toml";
const SOURCE_DIRS: &[&str] = &["src", "tests", "test", "lib", "app"];
const VENV_DIRS: &[&str] = &[".venv", "venv", "env", ".virtualenv"];
const ACTIVE_ENV_VARS: &[&str] = &["VIRTUAL_ENV", "CONDA_PREFIX"];
const FAST_TOOL: &str = "uv";
const SYSTEM_INTERPRETERS: &[&str] = &["python3", "python"];

/// The process-level inputs resolution depends on. Injected so resolution can
/// be exercised against a synthetic environment.
#[derive(Debug, Clone)]
pub struct HostEnvironment {
    pub vars: HashMap<String, String>,
    pub cwd: PathBuf,
}

impl HostEnvironment {
    pub fn current() -> Self {
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self { vars, cwd }
    }

    fn var(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn search_path(&self) -> Option<&str> {
        self.var(path_var_name(&self.vars))
    }
}

/// `PATH` on unix; on Windows the key may be spelled `Path`.
fn path_var_name(vars: &HashMap<String, String>) -> &str {
    vars.keys()
        .find(|k| k.eq_ignore_ascii_case("PATH"))
        .map(String::as_str)
        .unwrap_or("PATH")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStrategy {
    FastTool {
        tool: PathBuf,
    },
    ActiveEnvironment {
        variable: String,
        root: PathBuf,
        interpreter: PathBuf,
    },
    ProjectVenv {
        root: PathBuf,
        interpreter: PathBuf,
    },
    System {
        interpreter: PathBuf,
    },
}

impl ExecutionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FastTool { .. } => "uv",
            Self::ActiveEnvironment { .. } => "active_environment",
            Self::ProjectVenv { .. } => "project_venv",
            Self::System { .. } => "system",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedEnvironment {
    pub project_root: PathBuf,
    /// Canonical path of the file being debugged.
    pub target_file: PathBuf,
    pub launch_command: Vec<String>,
    pub working_directory: PathBuf,
    pub environment_variables: HashMap<String, String>,
    pub strategy: ExecutionStrategy,
}

#[derive(Debug, Clone)]
pub struct EnvironmentResolver {
    host: HostEnvironment,
    rejected_fast_tool_roots: HashSet<PathBuf>,
}

impl EnvironmentResolver {
    pub fn new(host: HostEnvironment) -> Self {
        Self {
            host,
            rejected_fast_tool_roots: HashSet::new(),
        }
    }

    pub fn from_process() -> Self {
        Self::new(HostEnvironment::current())
    }

    /// Skip the fast tool for `project_root` on later resolutions; set after the
    /// tool refused to treat the directory as a project.
    pub fn reject_fast_tool(&mut self, project_root: &Path) {
        warn!(
            "uv does not recognize {} as a project; falling back on next start",
            project_root.display()
        );
        self.rejected_fast_tool_roots
            .insert(project_root.to_path_buf());
    }

    pub fn resolve(
        &self,
        file_path: &str,
        use_test_runner: bool,
        extra_args: &[String],
    ) -> Result<ResolvedEnvironment> {
        let target_file = self.locate_file(file_path)?;
        let project_root = find_project_root(&target_file);
        let strategy = self.select_strategy(&project_root)?;

        let target_arg = target_file
            .strip_prefix(&project_root)
            .unwrap_or(&target_file)
            .to_string_lossy()
            .into_owned();
        let launch_command = launch_command(&strategy, use_test_runner, target_arg, extra_args);
        let environment_variables = self.environment_for(&strategy, &project_root);

        info!(
            "Resolved {} under {} strategy (project root {})",
            target_file.display(),
            strategy.name(),
            project_root.display()
        );
        debug!("Launch command: {:?}", launch_command);

        Ok(ResolvedEnvironment {
            working_directory: project_root.clone(),
            project_root,
            target_file,
            launch_command,
            environment_variables,
            strategy,
        })
    }

    /// Tries the path as given, its absolute form, relative to the working
    /// directory, then relative to the conventional source directories.
    pub fn locate_file(&self, file_path: &str) -> Result<PathBuf> {
        let given = PathBuf::from(file_path);
        let mut candidates = vec![given.clone()];
        if let Ok(absolute) = std::path::absolute(&given) {
            candidates.push(absolute);
        }
        candidates.push(self.host.cwd.join(&given));
        candidates.extend(SOURCE_DIRS.iter().map(|dir| self.host.cwd.join(dir).join(&given)));

        candidates
            .iter()
            .find(|candidate| candidate.is_file())
            .map(|found| found.canonicalize())
            .transpose()?
            .ok_or(DebugError::FileNotFound(given))
    }

    fn select_strategy(&self, project_root: &Path) -> Result<ExecutionStrategy> {
        if project_root.join(PROJECT_DESCRIPTOR).is_file()
            && !self.rejected_fast_tool_roots.contains(project_root)
        {
            if let Some(tool) = self.find_executable(FAST_TOOL) {
                return Ok(ExecutionStrategy::FastTool { tool });
            }
        }

        for variable in ACTIVE_ENV_VARS {
            let Some(root) = self.host.var(variable) else {
                continue;
            };
            let root = PathBuf::from(root);
            if let Some(interpreter) = venv_interpreter(&root) {
                return Ok(ExecutionStrategy::ActiveEnvironment {
                    variable: (*variable).to_string(),
                    root,
                    interpreter,
                });
            }
            debug!("{variable} is set but has no interpreter under {}", root.display());
        }

        let search_dirs = std::iter::once(project_root).chain(project_root.parent());
        for dir in search_dirs {
            for name in VENV_DIRS {
                let root = dir.join(name);
                if let Some(interpreter) = venv_interpreter(&root) {
                    return Ok(ExecutionStrategy::ProjectVenv { root, interpreter });
                }
            }
        }

        SYSTEM_INTERPRETERS
            .iter()
            .find_map(|name| self.find_executable(name))
            .map(|interpreter| ExecutionStrategy::System { interpreter })
            .ok_or(DebugError::NoInterpreterFound)
    }

    fn find_executable(&self, name: &str) -> Option<PathBuf> {
        let paths = self.host.search_path()?;
        which::which_in(name, Some(paths), &self.host.cwd).ok()
    }

    fn environment_for(
        &self,
        strategy: &ExecutionStrategy,
        project_root: &Path,
    ) -> HashMap<String, String> {
        let mut vars = self.host.vars.clone();
        vars.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

        match strategy {
            ExecutionStrategy::FastTool { .. } => {
                for variable in ACTIVE_ENV_VARS.iter().chain(&["CONDA_DEFAULT_ENV"]) {
                    vars.remove(*variable);
                }
            }
            ExecutionStrategy::ActiveEnvironment {
                variable,
                root,
                interpreter,
            } => {
                apply_venv(&mut vars, variable, root, interpreter, project_root);
            }
            ExecutionStrategy::ProjectVenv { root, interpreter } => {
                apply_venv(&mut vars, "VIRTUAL_ENV", root, interpreter, project_root);
            }
            ExecutionStrategy::System { .. } => {}
        }

        vars
    }
}

/// Walks up from the file's directory to the first directory holding a
/// project marker; falls back to the file's own directory.
pub fn find_project_root(file: &Path) -> PathBuf {
    let file_dir = file.parent().unwrap_or(file).to_path_buf();
    file_dir
        .ancestors()
        .find(|dir| PROJECT_MARKERS.iter().any(|marker| dir.join(marker).exists()))
        .map(Path::to_path_buf)
        .unwrap_or(file_dir)
}

fn venv_interpreter(root: &Path) -> Option<PathBuf> {
    let candidates: &[&str] = if cfg!(windows) {
        &["Scripts/python.exe", "python.exe"]
    } else {
        &["bin/python", "bin/python3"]
    };
    candidates
        .iter()
        .map(|relative| root.join(relative))
        .find(|path| path.is_file())
}

fn launch_command(
    strategy: &ExecutionStrategy,
    use_test_runner: bool,
    target_arg: String,
    extra_args: &[String],
) -> Vec<String> {
    let mut command = match strategy {
        ExecutionStrategy::FastTool { tool } => {
            vec![tool.to_string_lossy().into_owned(), "run".to_string()]
        }
        ExecutionStrategy::ActiveEnvironment { interpreter, .. }
        | ExecutionStrategy::ProjectVenv { interpreter, .. }
        | ExecutionStrategy::System { interpreter } => {
            vec![interpreter.to_string_lossy().into_owned()]
        }
    };

    let is_tool = matches!(strategy, ExecutionStrategy::FastTool { .. });
    let runner: &[&str] = match (use_test_runner, is_tool) {
        (true, true) => &["pytest", "--pdb", "-s"],
        (true, false) => &["-m", "pytest", "--pdb", "-s"],
        (false, true) => &["python", "-m", "pdb"],
        (false, false) => &["-m", "pdb"],
    };
    command.extend(runner.iter().map(|s| s.to_string()));
    command.push(target_arg);
    command.extend(extra_args.iter().cloned());
    command
}

fn apply_venv(
    vars: &mut HashMap<String, String>,
    marker: &str,
    root: &Path,
    interpreter: &Path,
    project_root: &Path,
) {
    vars.insert(marker.to_string(), root.to_string_lossy().into_owned());
    if let Some(bin_dir) = interpreter.parent() {
        let path_key = path_var_name(vars).to_string();
        prepend_path_entry(vars, &path_key, bin_dir);
    }
    prepend_path_entry(vars, "PYTHONPATH", project_root);
}

fn prepend_path_entry(vars: &mut HashMap<String, String>, key: &str, entry: &Path) {
    let mut entries: Vec<OsString> = vec![entry.as_os_str().to_os_string()];
    if let Some(existing) = vars.get(key).filter(|v| !v.is_empty()) {
        entries.extend(std::env::split_paths(existing).map(PathBuf::into_os_string));
    }
    match std::env::join_paths(entries) {
        Ok(joined) => {
            vars.insert(key.to_string(), joined.to_string_lossy().into_owned());
        }
        Err(e) => warn!("Could not prepend {} to {key}: {e}", entry.display()),
    }
}
