//! Built-in task bodies
//!
//! Control-flow nodes understood by the scheduler plus a few utility tasks.
//! Host applications register their own task types next to these.
//!
//! | type               | category     | fired ports                 |
//! |--------------------|--------------|-----------------------------|
//! | `start` / `end`    | start / end  | `exec_out` / none           |
//! | `set_variable`     | plain        | `exec_out`                  |
//! | `log`              | plain        | `exec_out`                  |
//! | `raise_error`      | plain        | none (always fails)         |
//! | `if`               | branch       | `true` / `false`            |
//! | `switch`           | branch       | `case_<value>` / `default`  |
//! | `for_loop_start`   | loop start   | `body` / `completed`        |
//! | `while_loop_start` | loop start   | `body` / `completed`        |
//! | `loop_end`         | loop end     | none (loops back)           |
//! | `break`/`continue` | loop control | none (loops back)           |
//! | `try`              | try          | `try_body`                  |
//! | `catch`            | catch        | `catch_body` / `exec_out`   |
//! | `fork`             | fork         | branch ports, concurrently  |
//! | `join`             | join         | `exec_out`                  |
//! | `parallel_foreach` | foreach      | `body` per item / `completed` |

pub mod basic;
pub mod branch;
pub mod concurrency;
pub mod loops;
pub mod try_catch;

pub use basic::{EndTask, LogTask, RaiseErrorTask, SetVariableTask, StartTask};
pub use branch::{IfTask, SwitchTask};
pub use concurrency::{ForkTask, JoinTask, ParallelForeachTask};
pub use loops::{BreakTask, ContinueTask, ForLoopStartTask, LoopEndTask, WhileLoopStartTask};
pub use try_catch::{CatchTask, TryTask};

use super::registry::TaskRegistry;

pub(crate) fn register_builtins(registry: &mut TaskRegistry) {
    registry
        .register_default::<StartTask>("start")
        .register_default::<EndTask>("end")
        .register_default::<SetVariableTask>("set_variable")
        .register_default::<LogTask>("log")
        .register_default::<RaiseErrorTask>("raise_error")
        .register_default::<IfTask>("if")
        .register_default::<SwitchTask>("switch")
        .register_default::<ForLoopStartTask>("for_loop_start")
        .register_default::<WhileLoopStartTask>("while_loop_start")
        .register_default::<LoopEndTask>("loop_end")
        .register_default::<BreakTask>("break")
        .register_default::<ContinueTask>("continue")
        .register_default::<TryTask>("try")
        .register_default::<CatchTask>("catch")
        .register_default::<ForkTask>("fork")
        .register_default::<JoinTask>("join")
        .register_default::<ParallelForeachTask>("parallel_foreach");
}

/// Parse a list parameter given either as a JSON array or as a string
/// holding one (falls back to comma-separated values)
pub(crate) fn as_list(value: &serde_json::Value) -> Option<Vec<serde_json::Value>> {
    use serde_json::Value;
    match value {
        Value::Array(items) => Some(items.clone()),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Some(Vec::new());
            }
            if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) {
                return Some(items);
            }
            Some(
                trimmed
                    .split(',')
                    .map(|part| Value::String(part.trim().to_string()))
                    .collect(),
            )
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_as_list() {
        assert_eq!(as_list(&json!([1, 2])), Some(vec![json!(1), json!(2)]));
        assert_eq!(as_list(&json!("[\"a\", 3]")), Some(vec![json!("a"), json!(3)]));
        assert_eq!(as_list(&json!("x, y")), Some(vec![json!("x"), json!("y")]));
        assert_eq!(as_list(&json!("")), Some(vec![]));
        assert_eq!(as_list(&json!(5)), None);
    }
}
