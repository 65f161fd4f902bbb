//! Script evaluation inside the worker process.
//!
//! The worker treats submitted text as `rhai` script. Variables and functions defined by one
//! interaction stay visible to the next for the lifetime of the session.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rhai::module_resolvers::{FileModuleResolver, ModuleResolversCollection};
use rhai::{AST, Dynamic, Engine, EvalAltResult, Position, Scope};

use crate::ipc::StreamHandler;
use crate::worker_protocol::{EvalReply, StreamChannel};

const SLEEP_CHECK_INTERVAL: Duration = Duration::from_millis(10);

pub struct Evaluator {
    engine: Engine,
    scope: Scope<'static>,
    functions: AST,
    interrupt: Arc<AtomicBool>,
}

impl Evaluator {
    pub fn new(class_path: &[PathBuf], interrupt: Arc<AtomicBool>, output: StreamHandler) -> Self {
        let mut engine = Engine::new();

        let mut resolvers = ModuleResolversCollection::new();
        for entry in class_path {
            resolvers.push(FileModuleResolver::new_with_path(entry.clone()));
        }
        engine.set_module_resolver(resolvers);

        // Cooperative check point: runs on every script operation.
        let progress_flag = interrupt.clone();
        engine.on_progress(move |_ops| {
            progress_flag
                .load(Ordering::SeqCst)
                .then_some(Dynamic::UNIT)
        });

        let print_output = output.clone();
        engine.on_print(move |text| print_output(StreamChannel::Out, format!("{text}\n")));
        let debug_output = output.clone();
        engine.on_debug(move |text, _source, _pos| {
            debug_output(StreamChannel::Err, format!("{text}\n"))
        });
        let eprint_output = output;
        engine.register_fn("eprint", move |text: &str| {
            eprint_output(StreamChannel::Err, format!("{text}\n"))
        });

        let sleep_flag = interrupt.clone();
        engine.register_fn(
            "sleep",
            move |millis: rhai::INT| -> Result<(), Box<EvalAltResult>> {
                let millis = u64::try_from(millis).unwrap_or(0);
                let deadline = Instant::now() + Duration::from_millis(millis);
                loop {
                    if sleep_flag.load(Ordering::SeqCst) {
                        return Err(Box::new(EvalAltResult::ErrorTerminated(
                            Dynamic::UNIT,
                            Position::NONE,
                        )));
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    thread::sleep(SLEEP_CHECK_INTERVAL.min(deadline - now));
                }
            },
        );

        engine.register_fn("cwd", || -> String {
            std::env::current_dir()
                .map(|path| path.to_string_lossy().to_string())
                .unwrap_or_default()
        });
        let entries: Vec<String> = class_path
            .iter()
            .map(|entry| entry.to_string_lossy().to_string())
            .collect();
        engine.register_fn("class_path", move || -> rhai::Array {
            entries.iter().cloned().map(Dynamic::from).collect()
        });

        Self {
            engine,
            scope: Scope::new(),
            functions: AST::empty(),
            interrupt,
        }
    }

    pub fn evaluate(&mut self, text: &str) -> EvalReply {
        let ast = match self.engine.compile_with_scope(&self.scope, text) {
            Ok(ast) => ast,
            Err(err) => return EvalReply::error(format!("parse error: {err}")),
        };
        self.functions = self.functions.merge(&ast.clone_functions_only());
        let program = self.functions.merge(&ast);

        let result = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut self.scope, &program);
        match result {
            Ok(value) if value.is_unit() => EvalReply::unit(),
            Ok(value) => EvalReply::value(render_value(&value)),
            Err(err) => {
                if self.interrupt.load(Ordering::SeqCst)
                    || matches!(*err, EvalAltResult::ErrorTerminated(..))
                {
                    EvalReply::interrupted()
                } else {
                    EvalReply::error(err.to_string())
                }
            }
        }
    }
}

fn render_value(value: &Dynamic) -> String {
    if value.is_string() {
        format!("{value:?}")
    } else {
        value.to_string()
    }
}
