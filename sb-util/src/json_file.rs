// Copyright (c) Facebook, Inc. and its affiliates.
//! JSON files with an optional `//` or `#` comment preamble.
use anyhow::{Context, Result};
use log::info;
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

fn is_comment(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with("//") || line.starts_with('#')
}

/// Comment lines are blanked rather than dropped so that parse errors keep
/// pointing at the right line.
fn strip_comments(buf: &str) -> String {
    buf.lines()
        .map(|line| if is_comment(line) { "\n".to_string() } else { format!("{}\n", line) })
        .collect()
}

pub trait JsonLoad: DeserializeOwned {
    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let buf = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        serde_json::from_str(&strip_comments(&buf)).with_context(|| format!("parsing {:?}", path))
    }
}

pub trait JsonSave: Default + Serialize {
    fn preamble() -> Option<String> {
        None
    }

    fn as_json(&self) -> Result<String> {
        let body = serde_json::to_string_pretty(self)?;
        Ok(format!("{}{}\n", Self::preamble().unwrap_or_default(), body.trim_end()))
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.as_json()?).with_context(|| format!("writing {:?}", path))
    }

    /// Writes the default contents to `path` unless it already exists.
    /// Returns whether the file was created.
    fn create_default<P: AsRef<Path>>(path: P) -> Result<bool> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut f = match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        f.write_all(Self::default().as_json()?.as_bytes())?;
        Ok(true)
    }
}

/// A config struct and the file it came from, if any.
#[derive(Clone, Debug)]
pub struct JsonConfigFile<T: JsonLoad + JsonSave> {
    pub path: Option<PathBuf>,
    pub data: T,
}

impl<T: JsonLoad + JsonSave> JsonConfigFile<T> {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        Ok(Self {
            data: T::load(path)?,
            path: Some(path.to_path_buf()),
        })
    }

    /// Without a path the defaults are used and nothing is persisted.
    pub fn load_or_create<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let path = match path {
            Some(v) => v,
            None => {
                return Ok(Self {
                    path: None,
                    data: T::default(),
                })
            }
        };
        if T::create_default(&path)? {
            info!("cfg: Created {:?}", path.as_ref());
        }
        Self::load(path)
    }

    pub fn save(&self) -> Result<()> {
        match self.path.as_ref() {
            Some(path) => self.data.save(path),
            None => Ok(()),
        }
    }
}

/// Command line handling for a struct which doubles as its own args file.
pub trait JsonArgs: JsonLoad + JsonSave {
    fn match_cmdline() -> clap::ArgMatches<'static>;
    fn verbosity(matches: &clap::ArgMatches) -> u32;
    /// Applies the command line on top of `self`. Returns whether anything
    /// changed.
    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<bool>;
}

pub trait JsonArgsHelper: JsonArgs {
    fn init_args_and_logging() -> Result<JsonConfigFile<Self>>;
}

impl<T: JsonArgs> JsonArgsHelper for T {
    /// Parses the command line, sets up logging and loads `--args` if given.
    /// Command line updates are written back to the args file.
    fn init_args_and_logging() -> Result<JsonConfigFile<T>> {
        let matches = T::match_cmdline();
        super::init_logging(T::verbosity(&matches));

        let mut args_file = JsonConfigFile::<T>::load_or_create(matches.value_of("args"))?;
        if args_file.data.process_cmdline(&matches)? {
            if let Some(path) = args_file.path.as_ref() {
                info!("cfg: Updating {:?}", path);
            }
            args_file.save()?;
        }
        Ok(args_file)
    }
}

/// Report which is saved to `PATH.staging` first and then renamed over
/// `PATH`, so readers never observe a partial file.
#[derive(Debug)]
pub struct JsonReportFile<T: JsonSave> {
    pub path: Option<PathBuf>,
    pub staging: PathBuf,
    pub data: T,
}

impl<T: JsonSave> JsonReportFile<T> {
    pub fn new<P: AsRef<Path>>(path: Option<P>) -> Self {
        let path = path.map(|p| p.as_ref().to_path_buf());
        let staging = path
            .as_ref()
            .map(|p| {
                let mut name = p.clone().into_os_string();
                name.push(".staging");
                PathBuf::from(name)
            })
            .unwrap_or_default();
        Self {
            path,
            staging,
            data: T::default(),
        }
    }

    pub fn commit(&self) -> Result<()> {
        if let Some(path) = self.path.as_ref() {
            self.data.save(&self.staging)?;
            fs::rename(&self.staging, path)
                .with_context(|| format!("renaming {:?} to {:?}", &self.staging, path))?;
        }
        Ok(())
    }
}
