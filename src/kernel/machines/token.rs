use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::log::NOTHING;
use crate::engine::storage::StateStorage;
use crate::kernel::operation::{OperationContent, TokenType};
use crate::kernel::snapshot::{Snapshot, StateKind};

use super::{unexpected, OperationOutcome, StateMachine, StateMachineError};

/// Name -> id registry per token namespace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRegistry {
    tokens: BTreeMap<TokenType, BTreeMap<String, u32>>,
    last_applied_index: i64,
}

impl Default for TokenRegistry {
    fn default() -> Self {
        TokenRegistry {
            tokens: BTreeMap::new(),
            last_applied_index: NOTHING,
        }
    }
}

impl TokenRegistry {
    pub fn id_of(&self, token_type: TokenType, name: &str) -> Option<u32> {
        self.tokens.get(&token_type)?.get(name).copied()
    }

    /// Existing id for `name`, or the next free id in its namespace.
    fn get_or_create(&mut self, token_type: TokenType, name: &str) -> u32 {
        let names = self.tokens.entry(token_type).or_default();
        if let Some(&id) = names.get(name) {
            return id;
        }
        let id = names.len() as u32;
        names.insert(name.to_string(), id);
        id
    }
}

pub struct TokenStateMachine {
    storage: Box<dyn StateStorage<TokenRegistry>>,
    registry: TokenRegistry,
}

impl TokenStateMachine {
    pub fn new(storage: Box<dyn StateStorage<TokenRegistry>>) -> Self {
        TokenStateMachine {
            storage,
            registry: TokenRegistry::default(),
        }
    }

    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }
}

impl StateMachine for TokenStateMachine {
    fn kind(&self) -> StateKind {
        StateKind::Token
    }

    fn start(&mut self) -> Result<(), StateMachineError> {
        self.registry = self.storage.initial_state()?;
        Ok(())
    }

    fn apply(&mut self, content: &OperationContent, index: u64) -> Result<OperationOutcome, StateMachineError> {
        let request = match content {
            OperationContent::TokenAllocation(request) => request,
            other => return Err(unexpected(self.kind(), other)),
        };
        if index as i64 <= self.registry.last_applied_index {
            return Ok(OperationOutcome::AlreadyApplied);
        }

        let id = self.registry.get_or_create(request.token_type, &request.name);
        self.registry.last_applied_index = index as i64;
        Ok(OperationOutcome::Token { id })
    }

    fn flush(&mut self) -> Result<(), StateMachineError> {
        Ok(self.storage.persist(&self.registry)?)
    }

    fn last_applied_index(&self) -> i64 {
        self.registry.last_applied_index
    }

    fn add_to_snapshot(&self, snapshot: &mut Snapshot) -> Result<(), StateMachineError> {
        Ok(snapshot.add_state(StateKind::Token, &self.registry)?)
    }

    fn restore_from_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StateMachineError> {
        self.registry = snapshot.state(StateKind::Token)?;
        Ok(())
    }
}
