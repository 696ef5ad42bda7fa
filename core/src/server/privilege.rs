//! Copyright (c) 2024-2025 Hyflux, Inc.
//!
//! This file is part of Hyflux
//!
//! This program is free software: you can redistribute it and/or modify
//! it under the terms of the GNU Affero General Public License as published by
//! the Free Software Foundation, either version 3 of the License, or
//! (at your option) any later version.
//!
//! This program is distributed in the hope that it will be useful
//! but WITHOUT ANY WARRANTY; without even the implied warranty of
//! MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//! GNU Affero General Public License for more details.
//!
//! You should have received a copy of the GNU Affero General Public License
//! along with this program.  If not, see <http://www.gnu.org/licenses/>.

use nix::unistd::{self, User};
use std::ffi::CString;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::args::ServiceArgs;
use crate::config::settings::Settings;

/// privilege drop & root confinement request for the worker process
///
/// every step is best effort: a failure is logged and the worker keeps
/// running with the privileges it already has, because deployments rely on
/// the worker staying available even when the drop is refused
#[derive(Clone, Debug, Default)]
pub struct PrivilegeContext {
    /// unix username permission
    owner: String,
    /// confinement root directory
    root_dir: Option<PathBuf>,
    /// `-u` was given
    drop_requested: bool,
    /// `-c` was given
    confine_requested: bool,
    /// the process was started by a supervisor
    supervised: bool,
}

/// which privilege steps took effect
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrivilegeOutcome {
    /// false when the request was skipped entirely
    pub applied: bool,
    pub group: bool,
    pub user: bool,
    pub confined: bool,
}

impl PrivilegeContext {
    pub fn new(args: &ServiceArgs, settings: &Settings) -> Self {
        PrivilegeContext {
            owner: settings.master_owner.clone(),
            root_dir: (!settings.root_dir.is_empty()).then(|| PathBuf::from(&settings.root_dir)),
            drop_requested: args.privilege,
            confine_requested: args.chroot,
            supervised: settings.launched_by_supervisor(),
        }
    }

    /// check whether a privilege drop should be attempted at all
    /// standalone & test runs never carry supervisor arguments
    pub fn is_requested(&self) -> bool {
        self.drop_requested && self.supervised && !self.owner.is_empty()
    }

    /// drop privileges and confine the process root as requested
    ///
    /// the owner is resolved before confinement since the user database is
    /// usually not reachable inside the new root, and confinement happens
    /// before the user switch since it needs the current privileges
    pub fn apply(&self) -> PrivilegeOutcome {
        let mut outcome = PrivilegeOutcome::default();
        if !self.is_requested() {
            return outcome;
        }
        outcome.applied = true;
        // resolve the owner
        let user = match User::from_name(&self.owner) {
            Ok(Some(user)) => Some(user),
            Ok(None) => {
                error!(owner = %self.owner, "lookup owner failed: no such user");
                None
            }
            Err(e) => {
                error!(owner = %self.owner, "lookup owner failed: {e}");
                None
            }
        };
        // confine the process root
        if self.confine_requested {
            if let Some(root) = &self.root_dir {
                outcome.confined = confine(root);
            }
        }
        let Some(user) = user else {
            return outcome;
        };
        // supplementary groups first, they need the current privileges
        match CString::new(user.name.as_str()) {
            Ok(name) => {
                if let Err(e) = unistd::initgroups(&name, user.gid) {
                    warn!(owner = %self.owner, "initgroups failed: {e}");
                }
            }
            Err(e) => warn!(owner = %self.owner, "invalid owner name: {e}"),
        }
        match unistd::setgid(user.gid) {
            Ok(()) => {
                info!(gid = user.gid.as_raw(), "setgid ok");
                outcome.group = true;
            }
            Err(e) => error!(gid = user.gid.as_raw(), "setgid failed: {e}"),
        }
        match unistd::setuid(user.uid) {
            Ok(()) => {
                info!(uid = user.uid.as_raw(), "setuid ok");
                outcome.user = true;
            }
            Err(e) => error!(uid = user.uid.as_raw(), "setuid failed: {e}"),
        }
        outcome
    }
}

/// confine the process to the given root and move into it
fn confine(root: &Path) -> bool {
    if let Err(e) = unistd::chroot(root) {
        error!(path = %root.display(), "chroot failed: {e}");
        return false;
    }
    info!(path = %root.display(), "chroot ok");
    if let Err(e) = unistd::chdir("/") {
        error!("chdir failed: {e}");
    }
    true
}
