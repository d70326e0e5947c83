//! Subprocess invocation.  Recipe commands run with stdout and stderr
//! merged into a single pipe so diagnostics interleave the way the tool
//! printed them; on unix this needs posix_spawn since the std process
//! API cannot feed both streams into one pipe.  Dependency extraction
//! instead streams the tool's stdout line by line.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use anyhow::{anyhow, bail, Context as _};

pub struct CmdResult {
    pub success: bool,
    /// Merged console output.
    pub output: Vec<u8>,
}

/// Render an argv for diagnostics.
pub fn print_process(argv: &[String]) -> String {
    argv.iter()
        .map(|a| {
            if a.contains(' ') {
                format!("'{}'", a)
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(unix)]
fn check_posix(func: &str, ret: libc::c_int) -> anyhow::Result<()> {
    if ret != 0 {
        bail!("{}: {}", func, std::io::Error::from_raw_os_error(ret));
    }
    Ok(())
}

#[cfg(unix)]
struct PosixSpawnFileActions(libc::posix_spawn_file_actions_t);

#[cfg(unix)]
impl PosixSpawnFileActions {
    fn new() -> anyhow::Result<Self> {
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            check_posix(
                "posix_spawn_file_actions_init",
                libc::posix_spawn_file_actions_init(&mut actions),
            )?;
            Ok(Self(actions))
        }
    }

    fn as_ptr(&mut self) -> *mut libc::posix_spawn_file_actions_t {
        &mut self.0
    }

    fn adddup2(&mut self, fd: i32, newfd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_adddup2",
                libc::posix_spawn_file_actions_adddup2(&mut self.0, fd, newfd),
            )
        }
    }

    fn addclose(&mut self, fd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_addclose",
                libc::posix_spawn_file_actions_addclose(&mut self.0, fd),
            )
        }
    }
}

#[cfg(unix)]
impl Drop for PosixSpawnFileActions {
    fn drop(&mut self) {
        unsafe { libc::posix_spawn_file_actions_destroy(&mut self.0) };
    }
}

/// Run a command to completion, capturing stdout and stderr into one
/// merged buffer.
#[cfg(unix)]
pub fn run_command(argv: &[String]) -> anyhow::Result<CmdResult> {
    use std::io::Write;
    use std::os::fd::FromRawFd;
    use std::os::unix::process::ExitStatusExt;

    extern "C" {
        static environ: *const *mut libc::c_char;
    }

    if argv.is_empty() {
        bail!("empty command line");
    }
    let cargs: Vec<std::ffi::CString> = argv
        .iter()
        .map(|a| std::ffi::CString::new(a.as_str()))
        .collect::<Result<_, _>>()
        .map_err(|_| anyhow!("nul byte in command line"))?;
    let mut argp: Vec<*const libc::c_char> = cargs.iter().map(|c| c.as_ptr()).collect();
    argp.push(std::ptr::null());

    let (pid, mut pipe) = unsafe {
        let mut fds: [libc::c_int; 2] = [0; 2];
        if libc::pipe(fds.as_mut_ptr()) != 0 {
            bail!("pipe: {}", std::io::Error::last_os_error());
        }

        let mut actions = PosixSpawnFileActions::new()?;
        // stdout/stderr => pipe
        actions.adddup2(fds[1], 1)?;
        actions.adddup2(fds[1], 2)?;
        // close pipe in child
        actions.addclose(fds[0])?;
        actions.addclose(fds[1])?;

        let mut pid: libc::pid_t = 0;
        check_posix(
            "posix_spawnp",
            libc::posix_spawnp(
                &mut pid,
                cargs[0].as_ptr(),
                actions.as_ptr(),
                std::ptr::null(),
                argp.as_ptr() as *const *mut libc::c_char,
                environ,
            ),
        )
        .with_context(|| format!("unable to execute {}", argv[0]))?;

        libc::close(fds[1]);
        (pid, std::fs::File::from_raw_fd(fds[0]))
    };

    let mut output = Vec::new();
    pipe.read_to_end(&mut output)?;

    let status = unsafe {
        let mut status: i32 = 0;
        if libc::waitpid(pid, &mut status, 0) < 0 {
            bail!("waitpid: {}", std::io::Error::last_os_error());
        }
        std::process::ExitStatus::from_raw(status)
    };

    if let Some(sig) = status.signal() {
        let _ = write!(output, "signal {}", sig);
    }

    Ok(CmdResult {
        success: status.success(),
        output,
    })
}

#[cfg(not(unix))]
pub fn run_command(argv: &[String]) -> anyhow::Result<CmdResult> {
    if argv.is_empty() {
        bail!("empty command line");
    }
    let out = Command::new(&argv[0])
        .args(&argv[1..])
        .output()
        .with_context(|| format!("unable to execute {}", argv[0]))?;
    let mut output = out.stdout;
    output.extend_from_slice(&out.stderr);
    Ok(CmdResult {
        success: out.status.success(),
        output,
    })
}

/// A dependency-emitting tool run, streaming stdout one line at a time.
/// stderr passes straight through to the user.
pub struct DepStream {
    child: Child,
    reader: BufReader<ChildStdout>,
    argv0: String,
}

pub fn spawn_deps(argv: &[String], cwd: &Path) -> anyhow::Result<DepStream> {
    if argv.is_empty() {
        bail!("empty command line");
    }
    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .spawn()
        .with_context(|| format!("unable to execute {}", argv[0]))?;
    let stdout = child.stdout.take().unwrap();
    Ok(DepStream {
        child,
        reader: BufReader::new(stdout),
        argv0: argv[0].clone(),
    })
}

impl DepStream {
    /// Next output line without its newline; None at end of stream.
    pub fn read_line(&mut self) -> anyhow::Result<Option<String>> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .with_context(|| format!("read dependency output of {}", self.argv0))?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Drain any unread output and reap the child.  Returns whether it
    /// exited successfully.
    pub fn finish(mut self) -> anyhow::Result<bool> {
        // Skip to the end rather than closing the pipe under the tool;
        // some tools complain loudly about a broken pipe.
        let mut sink = Vec::new();
        let _ = self.reader.read_to_end(&mut sink);
        let status = self
            .child
            .wait()
            .with_context(|| format!("wait for {}", self.argv0))?;
        Ok(status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_captures_merged_output() -> anyhow::Result<()> {
        let r = run_command(&[
            "sh".to_string(),
            "-c".to_string(),
            "echo out; echo err >&2".to_string(),
        ])?;
        assert!(r.success);
        let text = String::from_utf8(r.output).unwrap();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
        Ok(())
    }

    #[test]
    fn run_reports_failure() -> anyhow::Result<()> {
        let r = run_command(&["sh".to_string(), "-c".to_string(), "exit 3".to_string()])?;
        assert!(!r.success);
        Ok(())
    }

    #[test]
    fn missing_tool_is_an_error() {
        assert!(run_command(&["/no/such/tool".to_string()]).is_err());
    }

    #[test]
    fn dep_stream_reads_lines() -> anyhow::Result<()> {
        let mut s = spawn_deps(
            &[
                "sh".to_string(),
                "-c".to_string(),
                "printf 'a\\nb\\n'".to_string(),
            ],
            Path::new("."),
        )?;
        assert_eq!(s.read_line()?.as_deref(), Some("a"));
        assert_eq!(s.read_line()?.as_deref(), Some("b"));
        assert_eq!(s.read_line()?, None);
        assert!(s.finish()?);
        Ok(())
    }
}
