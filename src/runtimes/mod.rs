mod cpp;
mod java;
mod javascript;
mod python;

pub use cpp::CppRunner;
pub use java::JavaRunner;
pub use javascript::JavaScriptRunner;
pub use python::PythonRunner;

use crate::config::EngineConfig;
use crate::runtime::{Language, RuntimeRegistry};

/// Initialize runtime registry with a runner for every supported language
pub fn init_registry(config: &EngineConfig) -> RuntimeRegistry {
    let mut registry = RuntimeRegistry::new();

    for language in Language::ALL {
        let options = config.language_config(language);
        match language {
            Language::JavaScript => registry.register(Box::new(JavaScriptRunner::from_config(&options))),
            Language::Python => registry.register(Box::new(PythonRunner::from_config(&options))),
            Language::Java => registry.register(Box::new(JavaRunner::from_config(&options))),
            Language::Cpp => registry.register(Box::new(CppRunner::from_config(&options))),
        }
    }

    registry
}
