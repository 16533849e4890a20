//! Skein: a suspendable stack-machine scripting core.
//!
//! The crate covers the middle of a small language implementation: a
//! bytecode [`compile`]r that lowers an externally produced AST, a
//! [`Vm`] that executes the result, and a snapshot serializer that
//! freezes the whole machine at a privileged call (a "syscall") so a
//! host can carry it out of process and resume it later with a return
//! value.
//!
//! ```no_run
//! use std::rc::Rc;
//! use skein::{compile, Registries, Vm};
//!
//! # fn ast() -> Vec<skein::Node> { Vec::new() }
//! let program = compile(&ast()).unwrap();
//! let mut vm = Vm::new(&program, Rc::new(Registries::standard()));
//!
//! let snapshot = vm.run(None);
//! // On Status::Syscall, resolve snapshot.syscall on the host side,
//! // then Vm::deserialize(&snapshot.state, Some(result), ...) to
//! // continue where the machine stopped.
//! ```

pub mod bytecode;
pub mod lang;
pub mod runtime;

pub use bytecode::{compile, CompileError, Instruction, Opcode, Program};
pub use lang::{BinaryOp, Function, Literal, Node, UnaryOp, Value};
pub use runtime::{
    CallFrame, NativeOutcome, Registries, RuntimeError, RuntimeErrorKind, Snapshot, SnapshotError,
    Status, SyscallRecord, Vm, VmConfig,
};

#[cfg(test)]
mod scenario_tests {
    //! End-to-end flows: compile, run to the trap, round-trip, resume.

    use std::rc::Rc;

    use crate::lang::ast::{BinaryOp, Literal, Node};
    use crate::{compile, Registries, Status, Value, Vm};

    fn num(n: f64, at: u32) -> Node {
        Node::Literal {
            value: Literal::Number(n),
            line: at,
        }
    }

    fn string(s: &str, at: u32) -> Node {
        Node::Literal {
            value: Literal::String(s.to_string()),
            line: at,
        }
    }

    fn ident(name: &str, at: u32) -> Node {
        Node::Identifier {
            name: name.to_string(),
            line: at,
        }
    }

    fn binary(op: BinaryOp, left: Node, right: Node, at: u32) -> Node {
        Node::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
            line: at,
        }
    }

    fn declare(name: &str, init: Node, at: u32) -> Node {
        Node::Declaration {
            name: name.to_string(),
            init: Box::new(init),
            line: at,
        }
    }

    fn call(callee: &str, args: Vec<Node>, at: u32) -> Node {
        Node::Call {
            callee: Box::new(ident(callee, at)),
            args,
            line: at,
        }
    }

    fn call_stmt(callee: &str, args: Vec<Node>, at: u32) -> Node {
        Node::Expression {
            expr: Box::new(call(callee, args, at)),
            line: at,
        }
    }

    fn standard() -> Rc<Registries> {
        Rc::new(Registries::standard())
    }

    #[test]
    fn scenario_simple_expression_reaches_host() {
        // let a = 1 + 2; syscall("result", a);
        let program = compile(&[
            declare("a", binary(BinaryOp::Add, num(1.0, 1), num(2.0, 1), 1), 1),
            call_stmt(
                "syscall",
                vec![string("result", 2), ident("a", 2)],
                2,
            ),
        ])
        .unwrap();

        let mut vm = Vm::new(&program, standard());
        let snapshot = vm.run(None);

        assert_eq!(snapshot.status, Status::Syscall);
        let record = snapshot.syscall.unwrap();
        assert_eq!(record.name, "result");
        assert_eq!(record.args, vec![Value::Number(3.0)]);
    }

    #[test]
    fn scenario_input_protocol() {
        // let a = input(); let r = 2 + number(a); syscall("dummy", r);
        // with `input` registered as a syscall so the host supplies it.
        let mut registries = Registries::standard();
        registries.register_syscall("input", "input", |args, _| Ok(args));
        let registries = Rc::new(registries);

        let program = compile(&[
            declare("a", call("input", vec![], 1), 1),
            declare(
                "r",
                binary(
                    BinaryOp::Add,
                    num(2.0, 2),
                    call("number", vec![ident("a", 2)], 2),
                    2,
                ),
                2,
            ),
            call_stmt("syscall", vec![string("dummy", 3), ident("r", 3)], 3),
        ])
        .unwrap();

        let mut vm = Vm::new(&program, Rc::clone(&registries));
        let first = vm.run(None);
        assert_eq!(first.status, Status::Syscall);
        assert_eq!(first.syscall.unwrap().name, "input");

        let mut resumed =
            Vm::deserialize(&first.state, Some(Value::Number(3.0)), registries).unwrap();
        let second = resumed.run(None);

        assert_eq!(second.status, Status::Syscall);
        let record = second.syscall.unwrap();
        assert_eq!(record.name, "dummy");
        assert_eq!(record.args, vec![Value::Number(5.0)]);
    }

    #[test]
    fn scenario_list_mutation_is_visible_to_host() {
        // let xs = [1,2,3]; xs[1] = 9; syscall("r", xs);
        let program = compile(&[
            declare(
                "xs",
                Node::List {
                    elements: vec![num(1.0, 1), num(2.0, 1), num(3.0, 1)],
                    line: 1,
                },
                1,
            ),
            Node::Expression {
                expr: Box::new(Node::Assignment {
                    target: Box::new(Node::Subscript {
                        container: Box::new(ident("xs", 2)),
                        index: Box::new(num(1.0, 2)),
                        line: 2,
                    }),
                    value: Box::new(num(9.0, 2)),
                    line: 2,
                }),
                line: 2,
            },
            call_stmt("syscall", vec![string("r", 3), ident("xs", 3)], 3),
        ])
        .unwrap();

        let mut vm = Vm::new(&program, standard());
        let snapshot = vm.run(None);

        assert_eq!(snapshot.status, Status::Syscall);
        let record = snapshot.syscall.unwrap();
        assert_eq!(record.args.len(), 1);
        assert_eq!(record.args[0].to_string(), "[1, 9, 3]");
    }

    #[test]
    fn scenario_recursion() {
        // func fact(n){ if(n<=1){return 1;} return n*fact(n-1); }
        // syscall("r", fact(5));
        let fact = Node::FunctionDeclaration {
            name: "fact".to_string(),
            params: vec!["n".to_string()],
            body: vec![
                Node::If {
                    condition: Box::new(binary(BinaryOp::Lte, ident("n", 2), num(1.0, 2), 2)),
                    then_branch: Box::new(Node::Block {
                        body: vec![Node::Return {
                            value: Some(Box::new(num(1.0, 2))),
                            line: 2,
                        }],
                        line: 2,
                    }),
                    else_branch: None,
                    line: 2,
                },
                Node::Return {
                    value: Some(Box::new(binary(
                        BinaryOp::Mul,
                        ident("n", 3),
                        call("fact", vec![binary(BinaryOp::Sub, ident("n", 3), num(1.0, 3), 3)], 3),
                        3,
                    ))),
                    line: 3,
                },
            ],
            line: 1,
        };

        let program = compile(&[
            fact,
            call_stmt(
                "syscall",
                vec![string("r", 5), call("fact", vec![num(5.0, 5)], 5)],
                5,
            ),
        ])
        .unwrap();

        let mut vm = Vm::new(&program, standard());
        let snapshot = vm.run(None);

        assert_eq!(snapshot.status, Status::Syscall);
        assert_eq!(snapshot.syscall.unwrap().args, vec![Value::Number(120.0)]);
    }

    #[test]
    fn scenario_loop_with_break() {
        // let s=0; for(let i=0;i<10;i=i+1){ if(i==5){break;} s=s+i; }
        // syscall("r", s);
        let body = Node::Block {
            body: vec![
                Node::If {
                    condition: Box::new(binary(BinaryOp::Eq, ident("i", 3), num(5.0, 3), 3)),
                    then_branch: Box::new(Node::Block {
                        body: vec![Node::Break { line: 3 }],
                        line: 3,
                    }),
                    else_branch: None,
                    line: 3,
                },
                Node::Expression {
                    expr: Box::new(Node::Assignment {
                        target: Box::new(ident("s", 4)),
                        value: Box::new(binary(BinaryOp::Add, ident("s", 4), ident("i", 4), 4)),
                        line: 4,
                    }),
                    line: 4,
                },
            ],
            line: 2,
        };

        let program = compile(&[
            declare("s", num(0.0, 1), 1),
            Node::For {
                init: Some(Box::new(declare("i", num(0.0, 2), 2))),
                condition: Some(Box::new(binary(BinaryOp::Lt, ident("i", 2), num(10.0, 2), 2))),
                update: Some(Box::new(Node::Assignment {
                    target: Box::new(ident("i", 2)),
                    value: Box::new(binary(BinaryOp::Add, ident("i", 2), num(1.0, 2), 2)),
                    line: 2,
                })),
                body: Box::new(body),
                line: 2,
            },
            call_stmt("syscall", vec![string("r", 6), ident("s", 6)], 6),
        ])
        .unwrap();

        let mut vm = Vm::new(&program, standard());
        let snapshot = vm.run(None);

        assert_eq!(snapshot.status, Status::Syscall);
        assert_eq!(snapshot.syscall.unwrap().args, vec![Value::Number(10.0)]);
    }

    #[test]
    fn scenario_tuple_and_list_render_distinctly() {
        // let t=(1,2); syscall("r", t);  /  let l=[1,2]; syscall("r", l);
        let tuple_program = compile(&[
            declare(
                "t",
                Node::Tuple {
                    elements: vec![num(1.0, 1), num(2.0, 1)],
                    line: 1,
                },
                1,
            ),
            call_stmt("syscall", vec![string("r", 2), ident("t", 2)], 2),
        ])
        .unwrap();

        let mut vm = Vm::new(&tuple_program, standard());
        let record = vm.run(None).syscall.unwrap();
        assert!(record.args[0].repr().contains('('));

        let list_program = compile(&[
            declare(
                "l",
                Node::List {
                    elements: vec![num(1.0, 1), num(2.0, 1)],
                    line: 1,
                },
                1,
            ),
            call_stmt("syscall", vec![string("r", 2), ident("l", 2)], 2),
        ])
        .unwrap();

        let mut vm = Vm::new(&list_program, standard());
        let record = vm.run(None).syscall.unwrap();
        assert!(record.args[0].repr().contains('['));
    }

    #[test]
    fn scenario_resume_equals_inline_return() {
        // A suspended machine resumed with V behaves like a call that
        // returned V inline: both paths end with the same globals.
        let mut registries = Registries::standard();
        registries.register_syscall("ask", "ask", |args, _| Ok(args));
        let registries = Rc::new(registries);

        let suspended_flow = compile(&[declare("r", call("ask", vec![], 1), 1)]).unwrap();
        let mut vm = Vm::new(&suspended_flow, Rc::clone(&registries));
        let trapped = vm.run(None);
        assert_eq!(trapped.status, Status::Syscall);

        let mut resumed =
            Vm::deserialize(&trapped.state, Some(Value::Number(7.0)), Rc::clone(&registries))
                .unwrap();
        assert_eq!(resumed.run(None).status, Status::Halted);

        let inline_flow = compile(&[declare("r", num(7.0, 1), 1)]).unwrap();
        let mut inline = Vm::new(&inline_flow, registries);
        assert_eq!(inline.run(None).status, Status::Halted);

        assert_eq!(resumed.global("r"), inline.global("r"));
    }
}
