//! Cache of the retained `system/character/current` message.
//!
//! The persona's system prompt is injected into outgoing `llm.request`s,
//! so a character switch takes effect on the next conversation turn. The
//! subscription is dedup-exempt: the retained seed must be re-consumable
//! after a reconnect.

use std::sync::{Arc, RwLock};

use tars_contracts::events::CharacterCurrent;
use tracing::info;

/// Shared read-mostly cache of the active character.
#[derive(Clone, Default)]
pub struct CharacterStore {
    inner: Arc<RwLock<Option<CharacterCurrent>>>,
}

impl CharacterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, character: CharacterCurrent) {
        info!(name = %character.name, "active character updated");
        let mut slot = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(character);
    }

    pub fn current(&self) -> Option<CharacterCurrent> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// System prompt for outgoing LLM requests, if the character has one.
    pub fn system_prompt(&self) -> Option<String> {
        self.current().and_then(|c| c.system_prompt)
    }
}
