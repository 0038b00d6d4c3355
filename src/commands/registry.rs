//! Command registry
//!
//! Centralized registry for every command that executes on the shards.
//! Connection-level commands (MULTI, EVAL, INFO...) live in the dispatcher.

use super::{counter, key, keyspace, string, Command};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of all available commands
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn Command>>,
}

impl CommandRegistry {
    /// Create a new command registry and register all commands
    pub fn new() -> Self {
        let mut registry = CommandRegistry {
            commands: HashMap::new(),
        };

        // Register string commands
        registry.register(Arc::new(string::GetCommand));
        registry.register(Arc::new(string::SetCommand));
        registry.register(Arc::new(string::AppendCommand));
        registry.register(Arc::new(string::StrLenCommand));
        registry.register(Arc::new(string::MGetCommand));
        registry.register(Arc::new(string::MSetCommand));

        // Register key commands
        registry.register(Arc::new(key::DelCommand));
        registry.register(Arc::new(key::ExistsCommand));
        registry.register(Arc::new(key::RenameCommand));
        registry.register(Arc::new(key::RenameNxCommand));

        // Register counter commands
        registry.register(Arc::new(counter::IncrCommand));
        registry.register(Arc::new(counter::IncrByCommand));
        registry.register(Arc::new(counter::DecrCommand));
        registry.register(Arc::new(counter::DecrByCommand));

        // Register keyspace commands
        registry.register(Arc::new(keyspace::DbSizeCommand));
        registry.register(Arc::new(keyspace::FlushDbCommand));
        registry.register(Arc::new(keyspace::FlushAllCommand));
        registry.register(Arc::new(keyspace::KeysCommand));

        registry
    }

    /// Register a command
    fn register(&mut self, command: Arc<dyn Command>) {
        let name = command.name().to_uppercase();
        self.commands.insert(name, command);
    }

    /// Get a command by name (case-insensitive)
    pub fn get(&self, name: &str) -> Option<Arc<dyn Command>> {
        self.commands.get(&name.to_uppercase()).cloned()
    }

    /// Check if a command exists
    pub fn has_command(&self, name: &str) -> bool {
        self.commands.contains_key(&name.to_uppercase())
    }

    /// Get all command names
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}
