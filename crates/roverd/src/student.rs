//! Built-in student modules.
//!
//! Student code is compiled in and selected by name with `--exec-module`;
//! the dispatcher re-instantiates the chosen module through its factory on
//! every `execute` call.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;

use rover_executor::{Action, Api, ExecutionError, ModuleFactory, StudentModule};

type StudentFn = Arc<dyn Fn(&Api, &[Json]) -> Result<Json, ExecutionError> + Send + Sync>;

/// A module with no functions at all; every lookup fails (and is logged by
/// the dispatcher).
struct BlankModule;

impl StudentModule for BlankModule {
    fn function(&self, _name: &str) -> Option<StudentFn> {
        None
    }
}

/// Tank drive: each joystick's vertical axis drives one motor. Doubles as
/// the smoke-test program for a freshly wired robot.
struct DriveModule;

const DRIVES: [(&str, &str); 2] = [
    ("joystick_left_y", "left-motor"),
    ("joystick_right_y", "right-motor"),
];

impl StudentModule for DriveModule {
    fn function(&self, name: &str) -> Option<StudentFn> {
        match name {
            "teleop_setup" => Some(Arc::new(|api, _args| {
                api.print("teleop: tank drive ready");
                Ok(Json::Null)
            })),
            "teleop_main" => Some(Arc::new(|api, _args| {
                for (axis, motor) in DRIVES {
                    if let Some(value) = api.gamepad.get(axis, 0) {
                        api.robot.write(motor, "duty_cycle", value);
                    }
                }
                Ok(Json::Null)
            })),
            "autonomous_setup" => Some(Arc::new(|api, _args| {
                api.print("autonomous: creeping forward");
                api.actions.run(coast(), Duration::from_secs(3), false);
                Ok(Json::Null)
            })),
            "autonomous_main" => Some(Arc::new(|api, _args| {
                api.checkpoint()?;
                Ok(Json::Null)
            })),
            "challenge" => Some(Arc::new(|_api, args| {
                // The classic warm-up: increment the given number.
                args.first()
                    .and_then(Json::as_i64)
                    .map(|n| Json::from(n + 1))
                    .ok_or_else(|| ExecutionError::Student("challenge expects an integer".into()))
            })),
            _ => None,
        }
    }

    fn action(&self, name: &str) -> Option<Action> {
        (name == "coast").then(coast)
    }
}

fn coast() -> Action {
    Action::new("coast", || async {
        rover_executor::Actions::sleep(1.0).await;
        Ok(Json::Null)
    })
}

/// Resolve a registered module name to its factory.
pub fn module_factory(name: &str) -> Result<ModuleFactory, String> {
    match name {
        "blank" => Ok(Arc::new(|| Ok(Arc::new(BlankModule) as Arc<dyn StudentModule>))),
        "drive" => Ok(Arc::new(|| Ok(Arc::new(DriveModule) as Arc<dyn StudentModule>))),
        other => Err(format!("unknown student module {other:?}")),
    }
}
