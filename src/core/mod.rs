mod action;
mod version;

pub use action::{
    ActionList, ChangeAction, ChangeError, FileAction, LineAction, ModuleAction, PackageAction,
    SubAction, ToolError, Violation, is_module_version,
};
pub use version::{ToolchainVersion, VersionError, satisfies};
