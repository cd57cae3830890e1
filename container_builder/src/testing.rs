use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    builder::{Builder, Generated, Sleep},
    process::{self, Execute, Invocation, Output},
};

/// A [`Builder`] backed by a closure, which also remembers the order images were started in.
pub struct FnBuilder<F> {
    generate: F,
    started: Mutex<Vec<String>>,
}

impl<F> FnBuilder<F>
where
    F: Fn(&str) -> crate::Result<Generated> + Send + Sync,
{
    pub fn new(generate: F) -> Arc<Self> {
        Arc::new(Self {
            generate,
            started: Mutex::new(Vec::new()),
        })
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

impl<F> Builder for FnBuilder<F>
where
    F: Fn(&str) -> crate::Result<Generated> + Send + Sync,
{
    fn generate(&self, name: &str) -> crate::Result<Generated> {
        self.started.lock().unwrap().push(name.to_owned());
        (self.generate)(name)
    }
}

type Predicate = Box<dyn Fn(&Invocation) -> bool + Send + Sync>;

/// Records every invocation instead of running it. Invocations matching the failure predicate exit with code 1.
pub struct Recorder {
    invocations: Mutex<Vec<Invocation>>,
    fails: Predicate,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Self::failing(|_| false)
    }

    pub fn failing(fails: impl Fn(&Invocation) -> bool + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            invocations: Mutex::new(Vec::new()),
            fails: Box::new(fails),
        })
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn verbs(&self) -> Vec<String> {
        self.invocations()
            .into_iter()
            .filter_map(|invocation| {
                invocation
                    .argv
                    .into_iter()
                    .find(|arg| arg == "bud" || arg == "push")
            })
            .collect()
    }
}

impl Execute for Recorder {
    fn execute(&self, invocation: &Invocation) -> process::Result<Output> {
        self.invocations.lock().unwrap().push(invocation.clone());
        if (self.fails)(invocation) {
            let output = Output {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "boom".to_owned(),
            };
            return Err(process::Error::non_zero_exit(invocation, &output));
        }
        Ok(Output {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

/// A sleep that returns immediately and remembers how long it was asked to wait.
pub fn recorded_sleep() -> (Sleep, Arc<Mutex<Vec<Duration>>>) {
    let sleeps = Arc::new(Mutex::new(Vec::<Duration>::new()));
    let sleep: Sleep = {
        let sleeps = Arc::clone(&sleeps);
        Arc::new(move |duration: Duration| sleeps.lock().unwrap().push(duration))
    };
    (sleep, sleeps)
}
