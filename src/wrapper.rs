//! Supervised execution of external command-line tools.
//!
//! One call to [`CommandWrapper::execute`] spawns one child process and blocks
//! until it exits. The child's output is drained on a dedicated thread while
//! the child runs, and the child is killed on every way out of the call.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{MAIN_SEPARATOR, Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Mutex;
use std::thread;

use tracing::{Level, debug, error, info, trace, warn};

use crate::error::{PipelineJobError, Result};

#[cfg(windows)]
pub const LINE_SEPARATOR: &str = "\r\n";
#[cfg(not(windows))]
pub const LINE_SEPARATOR: &str = "\n";

const FORWARDED_ENV: [&str; 3] = ["HOME", "UID", "JAVA_HOME"];

/// Where tools are installed: a shared tools directory plus optional
/// per-package install directories.
#[derive(Debug, Clone, Default)]
pub struct ToolConfig {
    pub tools_dir: Option<PathBuf>,
    pub sequence_tools_dir: Option<PathBuf>,
    pub package_paths: BTreeMap<String, PathBuf>,
}

impl ToolConfig {
    pub fn with_tools_dir(tools_dir: impl Into<PathBuf>) -> Self {
        Self {
            tools_dir: Some(tools_dir.into()),
            ..Self::default()
        }
    }

    /// Looks for `exe` in the package directory, the sequence tools directory,
    /// the tools directory and finally the inherited `PATH`, in that order.
    pub fn resolve_file_in_path(&self, exe: &str, package: Option<&str>) -> Option<PathBuf> {
        let package_dir = package.and_then(|name| self.package_paths.get(name));
        let configured = package_dir
            .into_iter()
            .chain(self.sequence_tools_dir.iter())
            .chain(self.tools_dir.iter())
            .cloned();
        let inherited = std::env::var_os("PATH")
            .map(|path| std::env::split_paths(&path).collect::<Vec<_>>())
            .unwrap_or_default();

        configured
            .chain(inherited)
            .map(|dir| dir.join(exe))
            .find(|candidate| candidate.exists())
    }

    /// The resolved executable, or the bare name so `PATH` lookup happens at spawn time.
    pub fn executable(&self, exe: &str, package: Option<&str>) -> PathBuf {
        self.resolve_file_in_path(exe, package)
            .unwrap_or_else(|| PathBuf::from(exe))
    }
}

/// Computes the child's `PATH`.
///
/// `tools_dir` is prepended to `inherited`. When `executable` contains a path
/// separator, exists, and lives outside `tools_dir`, its parent directory is
/// prepended ahead of everything else. Returns `None` when there is nothing to
/// prepend.
pub fn compose_path(
    tools_dir: Option<&Path>,
    inherited: Option<&OsStr>,
    executable: &OsStr,
) -> Option<OsString> {
    let mut entries: Vec<PathBuf> = Vec::new();

    let exe_path = Path::new(executable);
    if executable.to_string_lossy().contains(MAIN_SEPARATOR)
        && let Some(exe_dir) = exe_path.parent()
        && !exe_dir.as_os_str().is_empty()
        && tools_dir != Some(exe_dir)
        && exe_path.exists()
    {
        entries.push(exe_dir.to_path_buf());
    }

    if let Some(dir) = tools_dir
        && !dir.as_os_str().is_empty()
    {
        entries.push(dir.to_path_buf());
    }

    if entries.is_empty() {
        return None;
    }

    if let Some(path) = inherited {
        entries.extend(std::env::split_paths(path));
    }

    match std::env::join_paths(entries) {
        Ok(path) => Some(path),
        Err(err) => {
            warn!(error = %err, "Unable to compose PATH; inheriting parent PATH");
            None
        }
    }
}

#[derive(Debug, Default)]
struct WrapperState {
    commands_executed: Vec<String>,
    last_return_code: Option<i32>,
}

#[derive(Debug)]
pub struct CommandWrapper {
    tools_dir: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    environment: BTreeMap<String, String>,
    capture_level: Level,
    warn_non_zero_exits: bool,
    throw_non_zero_exits: bool,
    state: Mutex<WrapperState>,
}

impl Default for CommandWrapper {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CommandWrapper {
    pub fn new(tools_dir: Option<PathBuf>) -> Self {
        let environment = FORWARDED_ENV
            .iter()
            .filter_map(|name| {
                std::env::var(name)
                    .ok()
                    .filter(|value| !value.trim().is_empty())
                    .map(|value| (name.to_string(), value.trim().to_string()))
            })
            .collect();

        Self {
            tools_dir,
            working_dir: None,
            environment,
            capture_level: Level::DEBUG,
            warn_non_zero_exits: true,
            throw_non_zero_exits: false,
            state: Mutex::new(WrapperState::default()),
        }
    }

    pub fn from_config(config: &ToolConfig) -> Self {
        Self::new(config.tools_dir.clone())
    }

    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) {
        self.working_dir = Some(dir.into());
    }

    pub fn add_to_environment(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.environment.insert(key.into(), value.into());
    }

    pub fn set_capture_level(&mut self, level: Level) {
        self.capture_level = level;
    }

    pub fn set_warn_non_zero_exits(&mut self, warn: bool) {
        self.warn_non_zero_exits = warn;
    }

    /// Turns a non-zero exit into [`PipelineJobError::NonZeroExit`]. Off by default.
    pub fn set_throw_non_zero_exits(&mut self, throw: bool) {
        self.throw_non_zero_exits = throw;
    }

    pub fn tools_dir(&self) -> Option<&Path> {
        self.tools_dir.as_deref()
    }

    pub fn commands_executed(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.commands_executed.clone())
            .unwrap_or_default()
    }

    pub fn last_return_code(&self) -> Option<i32> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.last_return_code)
    }

    /// Runs `argv` and returns its merged stdout/stderr, one line plus
    /// [`LINE_SEPARATOR`] per emitted line.
    pub fn execute_with_output<S: AsRef<OsStr>>(&self, argv: &[S]) -> Result<String> {
        self.execute(argv, None)
    }

    /// Runs `argv` to completion.
    ///
    /// Without `stdout`, stderr is merged into stdout and the combined stream is
    /// captured. With `stdout`, standard output goes to that file and the
    /// captured text is the child's stderr. A non-zero exit is logged, not
    /// raised, unless [`set_throw_non_zero_exits`](Self::set_throw_non_zero_exits) is on.
    pub fn execute<S: AsRef<OsStr>>(&self, argv: &[S], stdout: Option<&Path>) -> Result<String> {
        let Some(program) = argv.first().map(|arg| AsRef::<OsStr>::as_ref(arg)) else {
            return Err(PipelineJobError::Spawn {
                program: String::new(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty argument vector"),
            });
        };
        let program_name = program.to_string_lossy().to_string();
        let command_line = argv
            .iter()
            .map(|arg| AsRef::<OsStr>::as_ref(arg).to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        info!("\t{command_line}");
        if let Ok(mut state) = self.state.lock() {
            state.commands_executed.push(command_line);
        }

        let (reader, writer) =
            io::pipe().map_err(|err| PipelineJobError::io("Failed to create output pipe", err))?;

        let child = {
            let mut command = self.build_command(argv);
            match stdout {
                Some(path) => {
                    info!("\tredirecting STDOUT to: {}", path.display());
                    let file = File::create(path).map_err(|err| {
                        PipelineJobError::io(
                            format!("Failed to create stdout file {}", path.display()),
                            err,
                        )
                    })?;
                    command.stdout(file).stderr(writer);
                }
                None => {
                    let stderr = writer.try_clone().map_err(|err| {
                        PipelineJobError::io("Failed to duplicate output pipe", err)
                    })?;
                    command.stdout(writer).stderr(stderr);
                }
            }
            // Dropping the command closes our copies of the pipe's write end.
            command.spawn().map_err(|source| PipelineJobError::Spawn {
                program: program_name.clone(),
                source,
            })?
        };
        let mut guard = ChildGuard(child);

        let level = self.capture_level;
        let drain = thread::Builder::new()
            .name("command-output".into())
            .spawn(move || drain_lines(reader, level))
            .map_err(|err| PipelineJobError::io("Failed to start output reader", err))?;

        let status = guard
            .0
            .wait()
            .map_err(|err| {
                PipelineJobError::io(format!("Failed waiting for {program_name}"), err)
            })?;
        let captured = drain
            .join()
            .map_err(|_| {
                PipelineJobError::io(
                    "Output reader panicked",
                    io::Error::other("output reader thread panicked"),
                )
            })?
            .map_err(|err| PipelineJobError::io("Failed reading process output", err))?;

        let code = status.code().unwrap_or(-1);
        if let Ok(mut state) = self.state.lock() {
            state.last_return_code = Some(code);
        }
        if code != 0 {
            if self.warn_non_zero_exits {
                warn!("\tprocess exited with non-zero value: {code}");
            }
            if self.throw_non_zero_exits {
                return Err(PipelineJobError::NonZeroExit {
                    program: program_name,
                    code,
                });
            }
        }

        Ok(captured)
    }

    fn build_command<S: AsRef<OsStr>>(&self, argv: &[S]) -> Command {
        let program: &OsStr = argv[0].as_ref();
        let mut command = Command::new(program);
        command.args(&argv[1..]);

        let inherited = std::env::var_os("PATH");
        if let Some(path) = compose_path(self.tools_dir.as_deref(), inherited.as_deref(), program) {
            debug!("using path: {}", path.to_string_lossy());
            command.env("PATH", path);
        }

        command.envs(&self.environment);

        if let Some(dir) = &self.working_dir {
            debug!("using working directory: {}", dir.display());
            command.current_dir(dir);
        }

        command
    }
}

/// Kills the child when dropped; a no-op once the child has been reaped.
struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Ok(None) = self.0.try_wait() {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }
}

fn drain_lines(reader: impl io::Read, level: Level) -> io::Result<String> {
    let mut reader = BufReader::new(reader);
    let mut captured = String::new();
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        if reader.read_until(b'\n', &mut buffer)? == 0 {
            break;
        }
        if buffer.last() == Some(&b'\n') {
            buffer.pop();
            if buffer.last() == Some(&b'\r') {
                buffer.pop();
            }
        }
        let line = String::from_utf8_lossy(&buffer);
        log_line(level, &line);
        captured.push_str(&line);
        captured.push_str(LINE_SEPARATOR);
    }
    Ok(captured)
}

fn log_line(level: Level, line: &str) {
    if level == Level::ERROR {
        error!("\t{line}");
    } else if level == Level::WARN {
        warn!("\t{line}");
    } else if level == Level::INFO {
        info!("\t{line}");
    } else if level == Level::DEBUG {
        debug!("\t{line}");
    } else {
        trace!("\t{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn drained_lines_lose_only_their_terminator() {
        let captured = drain_lines(&b"x\r\r\nplain\nlast"[..], Level::DEBUG).unwrap();
        let expected = ["x\r", "plain", "last"]
            .iter()
            .map(|line| format!("{line}{LINE_SEPARATOR}"))
            .collect::<String>();
        assert_eq!(captured, expected);
    }

    #[test]
    fn tools_dir_precedes_inherited_path() {
        let path = compose_path(
            Some(Path::new("/opt/tools")),
            Some(OsStr::new("/usr/bin")),
            OsStr::new("bwa"),
        )
        .unwrap();
        let entries: Vec<_> = std::env::split_paths(&path).collect();
        assert_eq!(
            entries,
            vec![PathBuf::from("/opt/tools"), PathBuf::from("/usr/bin")]
        );
    }

    #[test]
    fn explicit_executable_dir_is_prepended() {
        let temp = tempdir().unwrap();
        let custom = temp.path().join("custom");
        fs::create_dir_all(&custom).unwrap();
        let exe = custom.join("aligner");
        fs::write(&exe, b"").unwrap();

        let path = compose_path(
            Some(Path::new("/opt/tools")),
            Some(OsStr::new("/usr/bin")),
            exe.as_os_str(),
        )
        .unwrap();
        let entries: Vec<_> = std::env::split_paths(&path).collect();
        assert_eq!(
            entries,
            vec![custom, PathBuf::from("/opt/tools"), PathBuf::from("/usr/bin")]
        );
    }

    #[test]
    fn executable_inside_tools_dir_is_not_duplicated() {
        let temp = tempdir().unwrap();
        let exe = temp.path().join("aligner");
        fs::write(&exe, b"").unwrap();

        let path = compose_path(Some(temp.path()), None, exe.as_os_str()).unwrap();
        let entries: Vec<_> = std::env::split_paths(&path).collect();
        assert_eq!(entries, vec![temp.path().to_path_buf()]);
    }

    #[test]
    fn missing_executable_is_not_prepended() {
        let path = compose_path(
            Some(Path::new("/opt/tools")),
            None,
            OsStr::new("/does/not/exist/aligner"),
        )
        .unwrap();
        let entries: Vec<_> = std::env::split_paths(&path).collect();
        assert_eq!(entries, vec![PathBuf::from("/opt/tools")]);
    }

    #[test]
    fn nothing_to_prepend_leaves_path_alone() {
        assert!(compose_path(None, Some(OsStr::new("/usr/bin")), OsStr::new("ls")).is_none());
    }

    #[test]
    fn resolve_prefers_package_directory() {
        let temp = tempdir().unwrap();
        let package = temp.path().join("pkg");
        let tools = temp.path().join("tools");
        fs::create_dir_all(&package).unwrap();
        fs::create_dir_all(&tools).unwrap();
        fs::write(package.join("Trinity"), b"").unwrap();
        fs::write(tools.join("Trinity"), b"").unwrap();

        let mut config = ToolConfig::with_tools_dir(&tools);
        config.package_paths.insert("TRINITY".into(), package.clone());

        assert_eq!(
            config.resolve_file_in_path("Trinity", Some("TRINITY")),
            Some(package.join("Trinity"))
        );
        assert_eq!(
            config.resolve_file_in_path("Trinity", None),
            Some(tools.join("Trinity"))
        );
        assert_eq!(
            config.executable("not-a-real-tool-xyz", None),
            PathBuf::from("not-a-real-tool-xyz")
        );
    }

    #[test]
    fn empty_argv_is_rejected() {
        let wrapper = CommandWrapper::default();
        let argv: [&str; 0] = [];
        assert!(matches!(
            wrapper.execute(&argv, None),
            Err(PipelineJobError::Spawn { .. })
        ));
    }
}
