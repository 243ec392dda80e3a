//! Optional per-task behavior machines: named states, guarded transitions,
//! enter/exit hooks. Transitions are driven by events fired from agents or
//! the orchestrator; each applied transition is published as a `task.state`
//! event.

use crate::events::EventBus;
use crate::executor::eval_predicate;
use crate::models::{Predicate, TaskEvent};
use crate::{MaestroError, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Hook invoked with the state name being entered or exited.
#[derive(Clone)]
pub struct StateHook(pub Arc<dyn Fn(&str) + Send + Sync>);

impl StateHook {
    pub fn new<F>(hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self(Arc::new(hook))
    }
}

impl std::fmt::Debug for StateHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StateHook")
    }
}

#[derive(Debug, Clone)]
pub struct BehaviorState {
    pub name: String,
    pub on_enter: Option<StateHook>,
    pub on_exit: Option<StateHook>,
}

impl BehaviorState {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            on_enter: None,
            on_exit: None,
        }
    }

    pub fn with_on_enter(mut self, hook: StateHook) -> Self {
        self.on_enter = Some(hook);
        self
    }

    pub fn with_on_exit(mut self, hook: StateHook) -> Self {
        self.on_exit = Some(hook);
        self
    }
}

/// One edge of the machine; the guard (if any) is evaluated against the
/// caller-supplied variables.
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: String,
    pub event: String,
    pub to: String,
    pub guard: Option<Predicate>,
}

#[derive(Debug)]
pub struct BehaviorMachine {
    states: HashMap<String, BehaviorState>,
    transitions: Vec<Transition>,
    current: String,
}

impl BehaviorMachine {
    pub fn new(states: Vec<BehaviorState>, transitions: Vec<Transition>, initial: &str) -> Result<Self> {
        let states: HashMap<String, BehaviorState> =
            states.into_iter().map(|s| (s.name.clone(), s)).collect();
        if !states.contains_key(initial) {
            return Err(MaestroError::Validation(format!(
                "unknown initial state: {initial}"
            )));
        }
        for t in &transitions {
            if !states.contains_key(&t.from) || !states.contains_key(&t.to) {
                return Err(MaestroError::Validation(format!(
                    "transition {} -> {} references unknown state",
                    t.from, t.to
                )));
            }
        }
        Ok(Self {
            states,
            transitions,
            current: initial.to_string(),
        })
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    /// Applies the first transition out of the current state matching
    /// `event` whose guard passes. Returns the new state name.
    pub fn fire(&mut self, event: &str, vars: &HashMap<String, Value>) -> Result<String> {
        let transition = self
            .transitions
            .iter()
            .find(|t| {
                t.from == self.current
                    && t.event == event
                    && t.guard.as_ref().map(|g| eval_predicate(g, vars)).unwrap_or(true)
            })
            .cloned()
            .ok_or_else(|| {
                MaestroError::Validation(format!(
                    "no transition for event {event} from state {}",
                    self.current
                ))
            })?;

        if let Some(hook) = self
            .states
            .get(&transition.from)
            .and_then(|s| s.on_exit.clone())
        {
            (hook.0)(&transition.from);
        }
        self.current = transition.to.clone();
        if let Some(hook) = self
            .states
            .get(&transition.to)
            .and_then(|s| s.on_enter.clone())
        {
            (hook.0)(&transition.to);
        }
        Ok(transition.to)
    }
}

/// Owns the machines of all live tasks.
#[derive(Clone)]
pub struct BehaviorEngine {
    machines: Arc<Mutex<HashMap<String, BehaviorMachine>>>,
    events: EventBus,
}

impl BehaviorEngine {
    pub fn new(events: EventBus) -> Self {
        Self {
            machines: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn attach(&self, task_id: &str, machine: BehaviorMachine) {
        let mut machines = self.machines.lock().expect("behavior lock poisoned");
        machines.insert(task_id.to_string(), machine);
    }

    pub fn state_of(&self, task_id: &str) -> Option<String> {
        let machines = self.machines.lock().expect("behavior lock poisoned");
        machines.get(task_id).map(|m| m.current().to_string())
    }

    /// Fires an event on the task's machine and publishes the transition.
    pub fn fire(
        &self,
        task_id: &str,
        event: &str,
        vars: &HashMap<String, Value>,
    ) -> Result<String> {
        let next = {
            let mut machines = self.machines.lock().expect("behavior lock poisoned");
            let machine = machines
                .get_mut(task_id)
                .ok_or_else(|| MaestroError::NotFound(format!("behavior machine {task_id}")))?;
            machine.fire(event, vars)?
        };
        self.events.publish(TaskEvent::new(
            "task.state",
            task_id,
            json!({ "event": event, "state": next }),
        ));
        Ok(next)
    }

    pub fn detach(&self, task_id: &str) {
        let mut machines = self.machines.lock().expect("behavior lock poisoned");
        machines.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn review_machine() -> BehaviorMachine {
        BehaviorMachine::new(
            vec![
                BehaviorState::named("drafting"),
                BehaviorState::named("reviewing"),
                BehaviorState::named("done"),
            ],
            vec![
                Transition {
                    from: "drafting".into(),
                    event: "submit".into(),
                    to: "reviewing".into(),
                    guard: None,
                },
                Transition {
                    from: "reviewing".into(),
                    event: "approve".into(),
                    to: "done".into(),
                    guard: Some(Predicate::VarEquals {
                        key: "score".into(),
                        value: json!("pass"),
                    }),
                },
            ],
            "drafting",
        )
        .unwrap()
    }

    #[test]
    fn transitions_follow_events() {
        let mut machine = review_machine();
        assert_eq!(machine.current(), "drafting");
        machine.fire("submit", &HashMap::new()).unwrap();
        assert_eq!(machine.current(), "reviewing");
    }

    #[test]
    fn guard_blocks_transition() {
        let mut machine = review_machine();
        machine.fire("submit", &HashMap::new()).unwrap();

        let err = machine.fire("approve", &HashMap::new()).unwrap_err();
        assert_eq!(err.code(), "VALIDATION");

        let vars = HashMap::from([("score".to_string(), json!("pass"))]);
        assert_eq!(machine.fire("approve", &vars).unwrap(), "done");
    }

    #[test]
    fn hooks_fire_on_enter_and_exit() {
        let exits = Arc::new(AtomicU32::new(0));
        let enters = Arc::new(AtomicU32::new(0));
        let e = exits.clone();
        let n = enters.clone();
        let mut machine = BehaviorMachine::new(
            vec![
                BehaviorState::named("a").with_on_exit(StateHook::new(move |_| {
                    e.fetch_add(1, Ordering::SeqCst);
                })),
                BehaviorState::named("b").with_on_enter(StateHook::new(move |_| {
                    n.fetch_add(1, Ordering::SeqCst);
                })),
            ],
            vec![Transition {
                from: "a".into(),
                event: "go".into(),
                to: "b".into(),
                guard: None,
            }],
            "a",
        )
        .unwrap();

        machine.fire("go", &HashMap::new()).unwrap();
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(enters.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn engine_publishes_state_events() {
        let events = EventBus::new();
        let engine = BehaviorEngine::new(events.clone());
        engine.attach("t1", review_machine());
        let mut sub = events.subscribe(Some("t1"), Some(&["task.state"]));

        engine.fire("t1", "submit", &HashMap::new()).unwrap();
        let event = sub.recv().await.unwrap();
        assert_eq!(event.data["state"], "reviewing");
        assert_eq!(engine.state_of("t1").as_deref(), Some("reviewing"));
    }

    #[test]
    fn invalid_machine_definitions_are_rejected() {
        let err = BehaviorMachine::new(
            vec![BehaviorState::named("a")],
            vec![Transition {
                from: "a".into(),
                event: "go".into(),
                to: "ghost".into(),
                guard: None,
            }],
            "a",
        )
        .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }
}
