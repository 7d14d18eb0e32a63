//! Per-request status accumulator.
//!
//! Every control-plane command builds exactly one [`StatusCode`], threads
//! it through all delegated calls, and serializes its bitmask plus message
//! into the response. The bit positions are part of the wire contract
//! (`statuscode` is the sum of the set bits' powers of two), so they must
//! not be reordered.

use crate::state::Command;

/// One failure category, mapped to a fixed bit position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Io,
    InputFormat,
    OutputFormat,
    Vcs,
    CompileState,
    DeployState,
    StartState,
    StopState,
    DispatchState,
    UpdateState,
    DeleteState,
}

impl Category {
    /// Bit position of this category in the wire bitmask.
    pub fn bit(self) -> u32 {
        match self {
            Category::Io => 0,
            Category::InputFormat => 1,
            Category::OutputFormat => 2,
            Category::Vcs => 3,
            Category::CompileState => 4,
            Category::DeployState => 5,
            Category::StartState => 6,
            Category::StopState => 7,
            Category::DispatchState => 8,
            Category::UpdateState => 9,
            Category::DeleteState => 10,
        }
    }

    /// Fixed human-readable sentence for this category.
    pub fn sentence(self) -> &'static str {
        match self {
            Category::Io => "An IO-Error occurred.",
            Category::InputFormat => {
                "The input does not provide the required fields or the JSON is malformed."
            }
            Category::OutputFormat => {
                "An error occurred during the creation of the output message."
            }
            Category::Vcs => {
                "An error occurred during interaction with a Data App's git repository."
            }
            Category::CompileState => {
                "Data Apps can only be compiled if they are not running and code is available."
            }
            Category::DeployState => {
                "Data Apps can only be deployed if they are compiled and not running."
            }
            Category::StartState => "Data Apps can only be started if they are in DEPLOYED state.",
            Category::StopState => "Data Apps can only be stopped if they are in RUNNING state.",
            Category::DispatchState => {
                "Messages can only be dispatched to Data Apps which are in RUNNING state."
            }
            Category::UpdateState => {
                "A Data App cannot be updated if it is running/deleted or during compilation/deployment/termination."
            }
            Category::DeleteState => {
                "A Data App cannot be deleted if it is running/deleted or during compilation/deployment/termination."
            }
        }
    }

    /// The precondition-violation category for a command, if it has one.
    pub fn state_error_for(command: Command) -> Option<Category> {
        match command {
            Command::Register | Command::Status => None,
            Command::Update => Some(Category::UpdateState),
            Command::Delete => Some(Category::DeleteState),
            Command::Compile => Some(Category::CompileState),
            Command::Deploy => Some(Category::DeployState),
            Command::Start => Some(Category::StartState),
            Command::Dispatch => Some(Category::DispatchState),
            Command::Stop => Some(Category::StopState),
        }
    }

    const ALL: [Category; 11] = [
        Category::Io,
        Category::InputFormat,
        Category::OutputFormat,
        Category::Vcs,
        Category::CompileState,
        Category::DeployState,
        Category::StartState,
        Category::StopState,
        Category::DispatchState,
        Category::UpdateState,
        Category::DeleteState,
    ];
}

/// Accumulated failure bits plus free-text diagnostics for one command.
#[derive(Debug, Default)]
pub struct StatusCode {
    bits: u64,
    diagnostics: Vec<String>,
}

impl StatusCode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a failure category. Setting the same category twice is a no-op.
    pub fn set(&mut self, category: Category) {
        self.bits |= 1u64 << category.bit();
    }

    /// Append a free-text diagnostic shown after the fixed sentences.
    pub fn append(&mut self, diagnostic: impl Into<String>) {
        self.diagnostics.push(diagnostic.into());
    }

    /// Mark a category and record the triggering error in one step.
    pub fn record(&mut self, category: Category, error: impl std::fmt::Display) {
        self.set(category);
        self.append(error.to_string());
    }

    pub fn is_success(&self) -> bool {
        self.bits == 0
    }

    /// Wire encoding: sum of powers of two of the set bits.
    pub fn code(&self) -> u64 {
        self.bits
    }

    /// Human-readable explanation: "Success." when clean, otherwise the
    /// fixed sentence for every set bit in bit order, followed by the
    /// appended diagnostics.
    pub fn message(&self) -> String {
        if self.is_success() {
            return "Success.".to_string();
        }

        let mut message = String::new();
        for category in Category::ALL {
            if self.bits & (1u64 << category.bit()) != 0 {
                message.push_str(category.sentence());
                message.push('\n');
            }
        }

        if !self.diagnostics.is_empty() {
            message.push_str("\nAdditional data:\n");
            for diagnostic in &self.diagnostics {
                message.push_str("\n- ");
                message.push_str(diagnostic);
            }
        }

        message
    }
}
