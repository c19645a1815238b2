//! Folder path conventions and name rules
//!
//! Folder paths always start and end with `/`; the root is `/`.

use std::collections::BTreeSet;

use crate::error::{Error, Result};

pub const ROOT_PATH: &str = "/";

/// Whether `path` is in canonical folder form.
pub fn is_folder_path(path: &str) -> bool {
    path.starts_with('/') && path.ends_with('/')
}

/// Path of the subfolder `name` inside `parent`.
pub fn join_subfolder(parent: &str, name: &str) -> String {
    format!("{}{}/", parent, name)
}

/// Non-overlapping set of folder paths requested by a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutPathSet {
    paths: BTreeSet<String>,
}

impl CheckoutPathSet {
    pub fn new<I, S>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths: BTreeSet<String> = paths.into_iter().map(Into::into).collect();
        if paths.is_empty() {
            return Err(Error::InvalidArgument("No checkout paths given".to_string()));
        }
        for path in &paths {
            if !is_folder_path(path) {
                return Err(Error::InvalidArgument(format!(
                    "Checkout paths must start and end with /: {}",
                    path
                )));
            }
        }
        for a in &paths {
            for b in &paths {
                if a != b && b.starts_with(a.as_str()) {
                    return Err(Error::InvalidArgument(format!(
                        "Overlapping checkout paths: {} and {}",
                        a, b
                    )));
                }
            }
        }
        Ok(Self { paths })
    }

    /// Parse a `:`-separated list.
    pub fn parse(joined: &str) -> Result<Self> {
        Self::new(joined.split(':').filter(|p| !p.is_empty()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Org and repo names: 4 to 20 characters of `[A-Za-z0-9_-]`.
pub fn validate_repo_name(kind: &str, name: &str) -> Result<()> {
    let len = name.chars().count();
    if !(4..=20).contains(&len) || !name.chars().all(is_name_char) {
        return Err(Error::InvalidArgument(format!(
            "Invalid {} name '{}': use 4 to 20 letters, digits, '-' or '_'",
            kind, name
        )));
    }
    Ok(())
}

/// Branch names end up inside row keys, so they may not contain separators.
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(':') || name.contains('/') {
        return Err(Error::InvalidArgument(format!("Invalid branch name '{}'", name)));
    }
    Ok(())
}
