use crate::config::CommandConfig;
use std::collections::HashMap;

/// Rule a command uses to pick the environment its worker must run in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvRule {
    /// No preference; the client's default (or the daemon's) applies
    None,
    /// Always this environment
    Fixed(String),
    /// The first remaining argument, unless it looks like an option
    FirstArg,
    /// The value following the given flag, e.g. `-e production`
    Flag(String),
    /// `test` when the task is `test` or `test:*`
    TestTask,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub env: EnvRule,
}

impl CommandSpec {
    pub fn new(env: EnvRule) -> Self {
        Self { env }
    }

    /// Environment requested by `args` (the arguments after the command name).
    pub fn env(&self, args: &[String]) -> Option<String> {
        match &self.env {
            EnvRule::None => None,
            EnvRule::Fixed(name) => Some(name.clone()),
            EnvRule::FirstArg => args
                .first()
                .filter(|arg| !arg.starts_with('-'))
                .cloned(),
            EnvRule::Flag(flag) => args
                .iter()
                .position(|arg| arg == flag)
                .and_then(|idx| args.get(idx + 1))
                .cloned(),
            EnvRule::TestTask => args
                .first()
                .filter(|task| *task == "test" || task.starts_with("test:"))
                .map(|_| "test".to_string()),
        }
    }
}

/// Commands the daemon knows how to dispatch, keyed by name.
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    commands: HashMap<String, CommandSpec>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            commands: HashMap::new(),
        };
        registry.register_builtin_commands();
        registry
    }

    /// Built-ins plus the entries of the `[commands]` table.
    pub fn with_config(commands: &std::collections::BTreeMap<String, CommandConfig>) -> Self {
        let mut registry = Self::new();
        for (name, config) in commands {
            registry.register(name, CommandSpec::new(config.to_rule()));
        }
        registry
    }

    fn register_builtin_commands(&mut self) {
        self.register("help", CommandSpec::new(EnvRule::None));
        self.register("console", CommandSpec::new(EnvRule::FirstArg));
        self.register("runner", CommandSpec::new(EnvRule::Flag("-e".to_string())));
        self.register("generate", CommandSpec::new(EnvRule::None));
        self.register("destroy", CommandSpec::new(EnvRule::None));
        self.register("rake", CommandSpec::new(EnvRule::TestTask));

        for name in ["test", "rspec", "cucumber"] {
            self.register(name, CommandSpec::new(EnvRule::Fixed("test".to_string())));
        }
    }

    pub fn register(&mut self, name: &str, spec: CommandSpec) {
        self.commands.insert(name.to_string(), spec);
    }

    pub fn lookup(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}
