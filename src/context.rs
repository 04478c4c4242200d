use std::rc::Rc;

use crate::{
    builtin,
    env::Env,
    error::ParseError,
    eval,
    macros::MacroProcessor,
    parser,
    value::{Module, Value},
};

/// Drives the full pipeline: parse, macro-expand, evaluate.
///
/// The context owns the root environment (with the builtins installed) and a
/// persistent macro scope, so bindings and macro definitions survive across
/// `evaluate` calls. That is what lets a REPL session accumulate state.
pub struct EvaluationContext {
    root: Rc<Env>,
    macros: MacroProcessor,
}

impl Default for EvaluationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EvaluationContext {
    pub fn new() -> Self {
        let root = Env::root();
        root.lock();
        builtin::install(&root);
        Self { root, macros: MacroProcessor::new() }
    }

    /// Runs a program. Parse and macro failures surface as `Err`; runtime
    /// failures come back as an ordinary `Value::Error`.
    pub fn evaluate(&mut self, source: &str) -> Result<Value, ParseError> {
        let mut program = parser::parse(source)?;

        let mut errors = Vec::new();
        for statement in &mut program {
            errors.extend(self.macros.process(statement));
        }
        if !errors.is_empty() {
            return Err(ParseError::MacroExpansion(errors));
        }

        Ok(eval::eval_program(&program, &self.root))
    }

    /// Registers a module: a named scope reachable through `.` member
    /// access. The module's environment chains to the root, so module
    /// members can still see the builtins.
    pub fn register_module(&mut self, name: &str, bindings: Vec<(&str, Value)>) {
        let env = Env::child(&self.root);
        env.lock();
        for (binding, value) in bindings {
            env.set(binding, value);
        }
        self.root.set(
            name,
            Value::Module(Rc::new(Module { name: name.to_string(), env })),
        );
    }
}

impl Drop for EvaluationContext {
    fn drop(&mut self) {
        self.root.unlock();
        self.root.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use anyhow::bail;

    use super::*;
    use crate::{
        test_utils::{all_testcases, load_test_pair, Expected},
        token::Position,
        value::Builtin,
    };

    #[test]
    fn end_to_end_scenarios() -> anyhow::Result<()> {
        for testcase in all_testcases() {
            let (source, expected) = load_test_pair(testcase)?;
            let mut context = EvaluationContext::new();
            let result = context.evaluate(&source);

            match (&result, &expected) {
                (Ok(value), Expected::Ok { output }) if !value.is_error() => {
                    if &value.to_string() != output {
                        bail!("testcase {}: got {}, expected {}", testcase, value, output);
                    }
                }
                (Ok(value), Expected::Err { error }) if value.is_error() => {
                    if !value.to_string().contains(error.as_str()) {
                        bail!("testcase {}: got {}, expected error {}", testcase, value, error);
                    }
                }
                (Err(parse_error), Expected::Err { error }) => {
                    if !parse_error.to_string().contains(error.as_str()) {
                        bail!(
                            "testcase {}: got {}, expected error {}",
                            testcase,
                            parse_error,
                            error
                        );
                    }
                }
                _ => bail!("testcase {}: got {:?}, expected {:?}", testcase, result, expected),
            }
        }
        Ok(())
    }

    #[test]
    fn state_persists_between_inputs() {
        let mut context = EvaluationContext::new();
        context.evaluate("let x = 40").unwrap();
        let result = context.evaluate("x + 2").unwrap();
        assert_eq!(result.to_string(), "42");
    }

    #[test]
    fn macros_persist_between_inputs() {
        let mut context = EvaluationContext::new();
        context.evaluate("let twice = macro(e) { quote(e + e) }").unwrap();
        let result = context.evaluate("twice(21)").unwrap();
        assert_eq!(result.to_string(), "42");
    }

    #[test]
    fn macro_arguments_are_quoted() {
        let mut context = EvaluationContext::new();
        let result = context
            .evaluate("let m = macro(x) { quote(x + x) }; m(3 + 1)")
            .unwrap();
        assert_eq!(result.to_string(), "8");
    }

    #[test]
    fn parse_errors_are_host_errors() {
        let mut context = EvaluationContext::new();
        assert!(context.evaluate("let = 5").is_err());
    }

    #[test]
    fn runtime_errors_are_values() {
        let mut context = EvaluationContext::new();
        let value = context.evaluate("1 / 0").unwrap();
        assert!(value.is_error());
    }

    fn answer(_args: &[Value], _env: &Rc<Env>, _pos: Position) -> Value {
        Value::Int(42)
    }

    #[test]
    fn module_member_access() {
        let mut context = EvaluationContext::new();
        context.register_module(
            "math",
            vec![
                ("pi", Value::Float(3.141592653589793)),
                ("answer", Value::Builtin(Rc::new(Builtin { name: "answer", call: answer }))),
            ],
        );

        assert_eq!(
            context.evaluate("math.pi > 3.14").unwrap().to_string(),
            "true"
        );
        assert_eq!(context.evaluate("math.answer()").unwrap().to_string(), "42");

        let missing = context.evaluate("math.tau").unwrap();
        assert_eq!(missing.to_string(), "error: [1:6] Identifier not found 'tau'");

        let not_module = context.evaluate("1.answer").unwrap();
        assert!(not_module.to_string().contains("int '.' is not defined"));
    }

    #[test]
    fn evaluation_leaves_no_environments_behind() {
        let before = crate::env::live_env_count();
        {
            let mut context = EvaluationContext::new();
            let value = context
                .evaluate(
                    "let adder = fn(a) { fn(b) { a + b } };
                     let add2 = adder(2);
                     let add3 = adder(3);
                     add2(add3(1))",
                )
                .unwrap();
            assert_eq!(value.to_string(), "6");
        }
        assert_eq!(crate::env::live_env_count(), before);
    }
}
