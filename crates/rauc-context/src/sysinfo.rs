//! System information handler.
//!
//! A system-info handler is an arbitrary executable configured by the
//! integrator. It is started with the caller's variables in its
//! environment and reports values by printing `RAUC_<NAME>=<value>` lines.
//! Standard output and standard error are read as one stream; lines that
//! do not carry the prefix or lack a `=` are ignored.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::ContextError;

/// Prefix of variables accepted from handler output.
pub const VARIABLE_PREFIX: &str = "RAUC_";

/// Variable carrying the system serial number.
pub const SYSTEM_SERIAL_VAR: &str = "RAUC_SYSTEM_SERIAL";
/// Variable carrying the system variant.
pub const SYSTEM_VARIANT_VAR: &str = "RAUC_SYSTEM_VARIANT";

/// Runs a system-info handler and collects the variables it prints.
#[derive(Debug, Clone)]
pub struct SystemInfoHarvester {
    program: PathBuf,
}

impl SystemInfoHarvester {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run the handler with `env` added to its environment.
    ///
    /// Returns only the variables printed by the handler. When the handler
    /// exits unsuccessfully, the variables parsed so far are carried in
    /// [`ContextError::HandlerExit`].
    pub fn harvest(
        &self,
        env: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, ContextError> {
        let (reader, writer) = std::io::pipe()?;

        let mut cmd = Command::new(&self.program);
        cmd.envs(env)
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer);

        let mut child = cmd.spawn().map_err(|source| ContextError::HandlerSpawn {
            handler: self.program.clone(),
            source,
        })?;
        // The command still owns the write ends; close them so the read
        // below sees end-of-file once the handler exits.
        drop(cmd);

        let mut harvested = HashMap::new();
        let mut read_error = None;
        for line in BufReader::new(reader).split(b'\n') {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    read_error = Some(e);
                    break;
                }
            };
            let line = String::from_utf8_lossy(&line);
            if let Some((key, value)) = parse_variable(&line) {
                debug!("Handler {} set {}", self.program.display(), key);
                harvested.insert(key.to_string(), value.to_string());
            }
        }

        let status = child.wait().map_err(|source| ContextError::HandlerIo {
            handler: self.program.clone(),
            source,
        })?;

        if let Some(source) = read_error {
            return Err(ContextError::HandlerIo {
                handler: self.program.clone(),
                source,
            });
        }

        if !status.success() {
            return Err(ContextError::HandlerExit {
                handler: self.program.clone(),
                status,
                harvested,
            });
        }

        Ok(harvested)
    }

    /// Run the handler and merge its variables into `vars`.
    ///
    /// `vars` is also the handler environment. Updates parsed before a
    /// failing exit are merged as well.
    pub fn harvest_into(&self, vars: &mut HashMap<String, String>) -> Result<(), ContextError> {
        match self.harvest(vars) {
            Ok(harvested) => {
                vars.extend(harvested);
                Ok(())
            }
            Err(ContextError::HandlerExit {
                handler,
                status,
                harvested,
            }) => {
                vars.extend(harvested.clone());
                Err(ContextError::HandlerExit {
                    handler,
                    status,
                    harvested,
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// Split a `RAUC_<NAME>=<value>` line once on the first `=`.
fn parse_variable(line: &str) -> Option<(&str, &str)> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if !line.starts_with(VARIABLE_PREFIX) {
        return None;
    }
    line.split_once('=')
}
