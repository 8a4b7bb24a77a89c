//! Setup handshake payloads
//!
//! Once a worker is connected the host hands it a bundle with its command
//! line, the file descriptors it should map, and a correlation number. The
//! worker answers with its OS process id.

/// A file descriptor the worker should map at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptorInfo {
    /// Key the worker looks the descriptor up by
    pub id: i32,
    pub fd: i32,
    pub offset: u64,
    pub size: u64,
    /// Close the host's copy once the bundle has been delivered
    pub auto_close: bool,
}

impl FileDescriptorInfo {
    /// Map a whole descriptor
    pub fn new(id: i32, fd: i32) -> Self {
        Self {
            id,
            fd,
            offset: 0,
            size: 0,
            auto_close: false,
        }
    }

    /// Map a region of a descriptor
    pub fn region(id: i32, fd: i32, offset: u64, size: u64) -> Self {
        Self {
            id,
            fd,
            offset,
            size,
            auto_close: false,
        }
    }

    pub fn with_auto_close(mut self) -> Self {
        self.auto_close = true;
        self
    }
}

/// Everything a worker needs to finish starting up
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetupBundle {
    pub args: Vec<String>,
    pub files: Vec<FileDescriptorInfo>,
    /// Host-side correlation number for the child
    pub child_process_id: i32,
    pub service_number: usize,
    /// Ask the worker to confirm that we are the process bound to it
    pub bind_to_caller_check: bool,
}

impl SetupBundle {
    /// Create a bundle with the given command line
    pub fn new(args: Vec<String>, child_process_id: i32) -> Self {
        Self {
            args,
            child_process_id,
            ..Self::default()
        }
    }

    pub fn with_files(mut self, files: Vec<FileDescriptorInfo>) -> Self {
        self.files = files;
        self
    }

    /// Value of a `--name=value` switch, if present
    pub fn switch_value(&self, name: &str) -> Option<&str> {
        let prefix = format!("--{}=", name);
        self.args
            .iter()
            .find_map(|arg| arg.strip_prefix(prefix.as_str()))
    }

    /// Whether a `--name` switch is present, with or without a value
    pub fn has_switch(&self, name: &str) -> bool {
        let bare = format!("--{}", name);
        self.args.iter().any(|arg| *arg == bare) || self.switch_value(name).is_some()
    }

    /// The process type this worker should run as
    pub fn process_type(&self) -> Option<&str> {
        self.switch_value("type")
    }
}
