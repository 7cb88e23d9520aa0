// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Raw per-method transport configuration, as written by the user.
///
/// Each payload-class flag left unset inherits from `move_data`; an unset
/// `move_data` means copy transport. `execute_blocks_in_place` does not
/// participate in the inheritance and defaults to off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportSpec {
    /// Base transport for every payload class without a specific setting.
    pub move_data: Option<bool>,
    /// Transport of positional and named arguments, caller to server.
    pub move_arguments: Option<bool>,
    /// Transport of the method's return value, server to caller.
    pub move_results: Option<bool>,
    /// Transport of yielded block arguments, server to caller.
    pub move_block_arguments: Option<bool>,
    /// Transport of block return values, caller to server.
    pub move_block_results: Option<bool>,
    /// Run caller-supplied blocks on the server side instead of relaying
    /// each yield back to the caller's domain.
    pub execute_blocks_in_place: Option<bool>,
}

impl TransportSpec {
    /// Creates a spec with every field unset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base transport for all payload classes.
    #[must_use]
    pub const fn move_data(mut self, value: bool) -> Self {
        self.move_data = Some(value);
        self
    }

    /// Sets argument transport, overriding the base.
    #[must_use]
    pub const fn move_arguments(mut self, value: bool) -> Self {
        self.move_arguments = Some(value);
        self
    }

    /// Sets result transport, overriding the base.
    #[must_use]
    pub const fn move_results(mut self, value: bool) -> Self {
        self.move_results = Some(value);
        self
    }

    /// Sets block-argument transport, overriding the base.
    #[must_use]
    pub const fn move_block_arguments(mut self, value: bool) -> Self {
        self.move_block_arguments = Some(value);
        self
    }

    /// Sets block-result transport, overriding the base.
    #[must_use]
    pub const fn move_block_results(mut self, value: bool) -> Self {
        self.move_block_results = Some(value);
        self
    }

    /// Sets whether blocks run on the server side.
    #[must_use]
    pub const fn execute_blocks_in_place(mut self, value: bool) -> Self {
        self.execute_blocks_in_place = Some(value);
        self
    }
}

/// Frozen transport policy for one method.
///
/// Produced from a [`TransportSpec`] when the wrapper starts; read-only
/// afterwards and shared by value with the server and its workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodPolicy {
    move_arguments: bool,
    move_results: bool,
    move_block_arguments: bool,
    move_block_results: bool,
    execute_blocks_in_place: bool,
}

impl MethodPolicy {
    /// Resolves a raw spec into a frozen policy, applying inheritance from
    /// `move_data`.
    #[must_use]
    pub const fn resolve(spec: TransportSpec) -> Self {
        Self {
            move_arguments: interpret(spec.move_arguments, spec.move_data),
            move_results: interpret(spec.move_results, spec.move_data),
            move_block_arguments: interpret(spec.move_block_arguments, spec.move_data),
            move_block_results: interpret(spec.move_block_results, spec.move_data),
            execute_blocks_in_place: match spec.execute_blocks_in_place {
                Some(value) => value,
                None => false,
            },
        }
    }

    /// Whether arguments are moved to the server rather than copied.
    #[must_use]
    pub const fn move_arguments(&self) -> bool {
        self.move_arguments
    }

    /// Whether results are moved back to the caller rather than copied.
    #[must_use]
    pub const fn move_results(&self) -> bool {
        self.move_results
    }

    /// Whether yielded block arguments are moved rather than copied.
    #[must_use]
    pub const fn move_block_arguments(&self) -> bool {
        self.move_block_arguments
    }

    /// Whether block return values are moved rather than copied.
    #[must_use]
    pub const fn move_block_results(&self) -> bool {
        self.move_block_results
    }

    /// Whether blocks run on the server side.
    #[must_use]
    pub const fn execute_blocks_in_place(&self) -> bool {
        self.execute_blocks_in_place
    }
}

impl From<TransportSpec> for MethodPolicy {
    fn from(spec: TransportSpec) -> Self {
        Self::resolve(spec)
    }
}

const fn interpret(flag: Option<bool>, base: Option<bool>) -> bool {
    match flag {
        Some(value) => value,
        None => match base {
            Some(value) => value,
            None => false,
        },
    }
}
