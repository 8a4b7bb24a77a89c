//! Creation params: which package hosts a worker and how it must be bound

use std::collections::HashMap;

/// Id that always resolves, to the registered default or the host's own params
pub const DEFAULT_PARAMS_ID: i32 = 0;

/// How workers for a given caller are created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreationParams {
    pub package_name: String,
    /// The service lives in another installed package
    pub is_external_service: bool,
    /// Require the worker to confirm our caller identity after connecting
    pub bind_to_caller_check: bool,
}

impl CreationParams {
    pub fn new(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            is_external_service: false,
            bind_to_caller_check: false,
        }
    }

    pub fn external_service(mut self, value: bool) -> Self {
        self.is_external_service = value;
        self
    }

    pub fn bind_to_caller_check(mut self, value: bool) -> Self {
        self.bind_to_caller_check = value;
        self
    }
}

/// Registry of creation params, owned by the launcher
#[derive(Debug)]
pub struct CreationParamsRegistry {
    host_package: String,
    default: Option<CreationParams>,
    registered: HashMap<i32, CreationParams>,
    next_id: i32,
}

impl CreationParamsRegistry {
    pub fn new(host_package: impl Into<String>) -> Self {
        Self {
            host_package: host_package.into(),
            default: None,
            registered: HashMap::new(),
            next_id: DEFAULT_PARAMS_ID + 1,
        }
    }

    /// Replace what `DEFAULT_PARAMS_ID` resolves to
    pub fn register_default(&mut self, params: CreationParams) {
        self.default = Some(params);
    }

    /// Register params and return their id
    pub fn register(&mut self, params: CreationParams) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        self.registered.insert(id, params);
        id
    }

    /// Forget params; returns them if they were registered
    pub fn unregister(&mut self, id: i32) -> Option<CreationParams> {
        self.registered.remove(&id)
    }

    /// Resolve an id
    pub fn get(&self, id: i32) -> Option<CreationParams> {
        if id == DEFAULT_PARAMS_ID {
            return Some(
                self.default
                    .clone()
                    .unwrap_or_else(|| CreationParams::new(self.host_package.clone())),
            );
        }
        self.registered.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }
}
