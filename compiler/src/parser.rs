// Parser for kernel description sources.
//
// Parses a token stream (from the lexer) into a `KernelSource` AST. One
// statement per line; instruction right-hand sides use a small arithmetic
// expression grammar with reductions. Uses chumsky combinators.
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns an AST plus any parse errors (non-fatal).
// Failure modes: syntax errors produce `Rich` diagnostics.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::kernel::IndexTag;
use crate::lexer::Token;

/// Result of parsing: AST plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub source: Option<KernelSource>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse a kernel source string. Lexes then parses.
pub fn parse(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    // Convert lexer output to chumsky stream.
    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = kernel_parser(source);
    let (kernel_source, parse_errors) = parser.parse(stream).into_output_errors();

    // Merge lex errors + parse errors.
    let mut all_errors: Vec<Rich<'static, Token, SimpleSpan>> = lex_result
        .errors
        .into_iter()
        .map(|e| {
            let span: SimpleSpan = (e.span.start..e.span.end).into();
            Rich::custom(span, e.message)
        })
        .collect();
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));

    ParseResult {
        source: kernel_source,
        errors: all_errors,
    }
}

fn binary(op: BinOp, lhs: ExprNode, rhs: ExprNode) -> ExprNode {
    ExprNode {
        span: (lhs.span.start..rhs.span.end).into(),
        kind: ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
    }
}

// ── Main parser builder ──
//
// All grammar rules are built inside `kernel_parser` so that the `source`
// reference is captured once and shared by all combinators.

fn kernel_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, KernelSource, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    // ── Newlines ──

    let nl = just(Token::Newline).repeated().ignored();

    // ── Identifier ──

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        Ident {
            name: source[span.start..span.end].to_string(),
            span,
        }
    });

    // ── Expressions ──

    let expr = {
        let ident = ident.clone();
        recursive(move |expr| {
            let number = select! {
                Token::Int(n) => ExprKind::Int(n),
                Token::Float(x) => ExprKind::Float(x),
            }
            .map_with(|kind, e| ExprNode {
                kind,
                span: e.span(),
            });

            let expr_list = expr
                .clone()
                .separated_by(just(Token::Comma))
                .collect::<Vec<_>>();

            // `j`, `@j` or `(j, @k)`
            let reduction_iname = just(Token::At)
                .or_not()
                .then(ident.clone())
                .map(|(at, name)| ReductionIname {
                    name,
                    duplicate: at.is_some(),
                });
            let reduction_inames = reduction_iname
                .clone()
                .map(|i| vec![i])
                .or(reduction_iname
                    .separated_by(just(Token::Comma))
                    .at_least(1)
                    .collect::<Vec<_>>()
                    .delimited_by(just(Token::LParen), just(Token::RParen)));

            let reduce = ident
                .clone()
                .filter(|id: &Ident| matches!(id.name.as_str(), "sum" | "product" | "max" | "min"))
                .then_ignore(just(Token::LParen))
                .then(reduction_inames)
                .then_ignore(just(Token::Comma))
                .then(expr.clone())
                .then_ignore(just(Token::RParen))
                .map_with(|((op, inames), body), e| ExprNode {
                    kind: ExprKind::Reduce {
                        op,
                        inames,
                        body: Box::new(body),
                    },
                    span: e.span(),
                });

            let call = ident
                .clone()
                .then(expr_list.delimited_by(just(Token::LParen), just(Token::RParen)))
                .map_with(|(function, args), e| ExprNode {
                    kind: ExprKind::Call { function, args },
                    span: e.span(),
                });

            let tagged = ident
                .clone()
                .then_ignore(just(Token::Dollar))
                .then(ident.clone())
                .map_with(|(name, tag), e| ExprNode {
                    kind: ExprKind::Tagged {
                        name: name.name,
                        tag: tag.name,
                    },
                    span: e.span(),
                });

            let subscript = ident
                .clone()
                .then(
                    expr.clone()
                        .separated_by(just(Token::Comma))
                        .at_least(1)
                        .collect::<Vec<_>>()
                        .delimited_by(just(Token::LBracket), just(Token::RBracket)),
                )
                .map_with(|(aggregate, index), e| ExprNode {
                    kind: ExprKind::Subscript { aggregate, index },
                    span: e.span(),
                });

            let var = ident.clone().map(|id| ExprNode {
                kind: ExprKind::Var(id.name),
                span: id.span,
            });

            let parens = expr
                .clone()
                .delimited_by(just(Token::LParen), just(Token::RParen));

            let atom = choice((number, reduce, call, tagged, subscript, var, parens)).boxed();

            // ── Power (right-associative) ──
            let power = atom
                .clone()
                .then(
                    just(Token::StarStar)
                        .ignore_then(atom)
                        .repeated()
                        .collect::<Vec<_>>(),
                )
                .map(|(base, mut exponents)| match exponents.pop() {
                    None => base,
                    Some(last) => {
                        let mut acc = last;
                        while let Some(prev) = exponents.pop() {
                            acc = binary(BinOp::Pow, prev, acc);
                        }
                        binary(BinOp::Pow, base, acc)
                    }
                });

            // ── Unary minus ──
            let unary = just(Token::Minus)
                .map_with(|_, e| e.span())
                .repeated()
                .foldr(power, |minus: SimpleSpan, operand: ExprNode| ExprNode {
                    span: (minus.start..operand.span.end).into(),
                    kind: ExprKind::Neg(Box::new(operand)),
                });

            // ── Products and sums (left-associative) ──
            let product_op = select! {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::SlashSlash => BinOp::FloorDiv,
                Token::Percent => BinOp::Mod,
            };
            let product = unary
                .clone()
                .foldl(product_op.then(unary).repeated(), |lhs, (op, rhs)| {
                    binary(op, lhs, rhs)
                });

            let sum_op = select! {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
            };
            product
                .clone()
                .foldl(sum_op.then(product).repeated(), |lhs, (op, rhs)| {
                    binary(op, lhs, rhs)
                })
                .boxed()
        })
    };

    let shape = expr
        .clone()
        .separated_by(just(Token::Comma))
        .at_least(1)
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LBracket), just(Token::RBracket));

    let ident_list = |open: Token, close: Token| {
        ident
            .clone()
            .separated_by(just(Token::Comma))
            .collect::<Vec<_>>()
            .delimited_by(just(open), just(close))
    };

    // ── kernel_stmt ──

    let kernel_stmt = just(Token::Kernel)
        .ignore_then(ident.clone())
        .map(StatementKind::Kernel);

    // ── set_stmt ──

    let set_value = select! {
        Token::Int(n) = e => SetValue::Int(n, e.span()),
        Token::Size(s) = e => SetValue::Size(s, e.span()),
        Token::Global = e => SetValue::Word("global".to_string(), e.span()),
    }
    .or(ident.clone().map(|id| SetValue::Word(id.name, id.span)));

    let set_stmt = just(Token::Set)
        .ignore_then(ident.clone())
        .then_ignore(just(Token::Equals))
        .then(set_value)
        .map(|(name, value)| StatementKind::Set(SetStmt { name, value }));

    // ── domain_stmt ──

    let cmp_op = select! {
        Token::Lt => CmpOp::Lt,
        Token::Le => CmpOp::Le,
        Token::Gt => CmpOp::Gt,
        Token::Ge => CmpOp::Ge,
        Token::EqEq => CmpOp::Eq,
    };

    let chain = expr
        .clone()
        .then(
            cmp_op
                .then(expr.clone())
                .repeated()
                .at_least(1)
                .collect::<Vec<_>>(),
        )
        .map_with(|(first, rest), e| ConstraintChain {
            first,
            rest,
            span: e.span(),
        });

    let domain_stmt = just(Token::Domain)
        .ignore_then(ident_list(Token::LBracket, Token::RBracket))
        .then_ignore(just(Token::Colon))
        .then(
            chain
                .separated_by(just(Token::And))
                .at_least(1)
                .collect::<Vec<_>>(),
        )
        .map(|(dims, constraints)| StatementKind::Domain(DomainStmt { dims, constraints }));

    // ── arg_stmt ──

    let array_arg = just(Token::Arg)
        .ignore_then(choice((
            just(Token::Global).to(ArgKind::Global),
            just(Token::Image).to(ArgKind::Image),
        )))
        .then(ident.clone())
        .then(ident.clone())
        .then(shape.clone())
        .map(|(((kind, dtype), name), shape)| {
            StatementKind::Arg(ArgStmt {
                kind,
                dtype,
                name,
                shape,
                approximately: None,
            })
        });

    let approx = select! { Token::Int(n) = e => (n, e.span()) };

    let scalar_arg = just(Token::Arg)
        .ignore_then(just(Token::Scalar))
        .ignore_then(ident.clone())
        .then(ident.clone())
        .then_ignore(just(Token::Tilde))
        .then(approx)
        .map(|((dtype, name), approximately)| {
            StatementKind::Arg(ArgStmt {
                kind: ArgKind::Scalar,
                dtype,
                name,
                shape: Vec::new(),
                approximately: Some(approximately),
            })
        });

    // ── temp_stmt ──

    let temp_stmt = just(Token::Temp)
        .ignore_then(ident.clone())
        .then(ident.clone())
        .then(shape.clone())
        .map(|((dtype, name), shape)| StatementKind::Temp(TempStmt { dtype, name, shape }));

    // ── tag_stmt ──

    let tag_value = select! { Token::AxisTag(t) => t }.or(ident.clone().try_map(
        |id: Ident, span| {
            IndexTag::parse(&id.name)
                .ok_or_else(|| Rich::custom(span, format!("unknown iname tag '{}'", id.name)))
        },
    ));

    let tag_entry = ident
        .clone()
        .then_ignore(just(Token::Equals))
        .then(tag_value)
        .map_with(|(iname, tag), e| TagEntry {
            iname,
            tag,
            span: e.span(),
        });

    let tag_stmt = just(Token::Tag)
        .ignore_then(
            tag_entry
                .separated_by(just(Token::Comma))
                .at_least(1)
                .collect::<Vec<_>>(),
        )
        .map(StatementKind::Tag);

    // ── insn_stmt ──

    let lvalue = ident
        .clone()
        .then(shape.or_not())
        .map_with(|(name, index), e| match index {
            Some(index) => ExprNode {
                kind: ExprKind::Subscript {
                    aggregate: name,
                    index,
                },
                span: e.span(),
            },
            None => ExprNode {
                kind: ExprKind::Var(name.name),
                span: name.span,
            },
        });

    let insn_stmt = just(Token::Insn)
        .ignore_then(ident.clone().then_ignore(just(Token::Colon)).or_not())
        .then(lvalue)
        .then_ignore(just(Token::Equals))
        .then(expr)
        .then(
            just(Token::Deps)
                .ignore_then(ident_list(Token::LParen, Token::RParen))
                .or_not(),
        )
        .then(
            just(Token::Inames)
                .ignore_then(ident_list(Token::LParen, Token::RParen))
                .or_not(),
        )
        .map(|((((id, assignee), expression), deps), inames)| {
            StatementKind::Insn(InsnStmt {
                id,
                assignee,
                expression,
                deps: deps.unwrap_or_default(),
                inames: inames.unwrap_or_default(),
            })
        });

    // ── Statement dispatch ──

    let statement = choice((
        kernel_stmt,
        set_stmt,
        domain_stmt,
        array_arg,
        scalar_arg,
        temp_stmt,
        tag_stmt,
        insn_stmt,
    ))
    .map_with(|kind, e| Statement {
        kind,
        span: e.span(),
    });

    // ── Kernel source ──

    nl.clone()
        .ignore_then(
            statement
                .separated_by(just(Token::Newline).repeated().at_least(1))
                .allow_trailing()
                .collect::<Vec<_>>(),
        )
        .then_ignore(nl)
        .map_with(move |statements, e| KernelSource {
            statements,
            span: e.span(),
        })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> KernelSource {
        let result = parse(source);
        assert!(
            result.errors.is_empty(),
            "unexpected errors: {:#?}",
            result.errors
        );
        result.source.expect("expected kernel source")
    }

    fn parse_one_stmt(source: &str) -> StatementKind {
        let src = parse_ok(source);
        assert_eq!(src.statements.len(), 1, "expected 1 statement");
        src.statements.into_iter().next().unwrap().kind
    }

    fn insn_expr(source: &str) -> ExprKind {
        let StatementKind::Insn(insn) = parse_one_stmt(source) else {
            panic!("expected Insn")
        };
        insn.expression.kind
    }

    #[test]
    fn empty_source() {
        assert!(parse_ok("").statements.is_empty());
        assert!(parse_ok("\n\n# comment only\n").statements.is_empty());
    }

    #[test]
    fn set_values() {
        let StatementKind::Set(set) = parse_one_stmt("set local_mem = 48KB") else {
            panic!("expected Set")
        };
        assert_eq!(set.name.name, "local_mem");
        assert!(matches!(set.value, SetValue::Size(v, _) if v == 48 * 1024));

        let StatementKind::Set(set) = parse_one_stmt("set local_mem_kind = global") else {
            panic!("expected Set")
        };
        assert!(matches!(&set.value, SetValue::Word(w, _) if w == "global"));
    }

    #[test]
    fn domain_chains() {
        let StatementKind::Domain(d) = parse_one_stmt("domain [i, j] : 0 <= i < n and 0 <= j < i + 1")
        else {
            panic!("expected Domain")
        };
        let dims: Vec<&str> = d.dims.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(dims, vec!["i", "j"]);
        assert_eq!(d.constraints.len(), 2);
        assert_eq!(d.constraints[0].rest.len(), 2);
        assert_eq!(d.constraints[1].rest[1].0, CmpOp::Lt);
    }

    #[test]
    fn args_and_temps() {
        let src = parse_ok(
            "arg global float32 a[n, 5]\n\
             arg scalar int32 n ~ 1000\n\
             temp float64 t[16]\n",
        );
        assert_eq!(src.statements.len(), 3);
        let StatementKind::Arg(a) = &src.statements[0].kind else {
            panic!("expected Arg")
        };
        assert_eq!(a.kind, ArgKind::Global);
        assert_eq!(a.shape.len(), 2);
        let StatementKind::Arg(n) = &src.statements[1].kind else {
            panic!("expected Arg")
        };
        assert_eq!(n.kind, ArgKind::Scalar);
        assert_eq!(n.approximately.map(|(v, _)| v), Some(1000));
        assert!(matches!(&src.statements[2].kind, StatementKind::Temp(t) if t.dtype.name == "float64"));
    }

    #[test]
    fn tags() {
        let StatementKind::Tag(entries) = parse_one_stmt("tag i = l.auto, j = ilp, k = g.0") else {
            panic!("expected Tag")
        };
        let tags: Vec<IndexTag> = entries.iter().map(|e| e.tag).collect();
        assert_eq!(
            tags,
            vec![IndexTag::AutoLocalAxis, IndexTag::Ilp, IndexTag::GroupAxis(0)]
        );
        assert!(!parse("tag i = fast").errors.is_empty());
    }

    #[test]
    fn insn_with_id_deps_and_inames() {
        let StatementKind::Insn(insn) = parse_one_stmt("insn w: t[i] = 2*a[i] deps(r, s) inames(j)")
        else {
            panic!("expected Insn")
        };
        assert_eq!(insn.id.map(|i| i.name), Some("w".to_string()));
        assert!(matches!(insn.assignee.kind, ExprKind::Subscript { .. }));
        assert_eq!(insn.deps.len(), 2);
        assert_eq!(insn.inames[0].name, "j");
    }

    #[test]
    fn insn_without_id() {
        let StatementKind::Insn(insn) = parse_one_stmt("insn x = 1") else {
            panic!("expected Insn")
        };
        assert!(insn.id.is_none());
        assert_eq!(insn.assignee.kind, ExprKind::Var("x".to_string()));
    }

    #[test]
    fn precedence() {
        // a + b * c ** 2 parses as a + (b * (c ** 2))
        let ExprKind::Binary { op, rhs, .. } = insn_expr("insn x = a + b * c ** 2") else {
            panic!("expected Binary")
        };
        assert_eq!(op, BinOp::Add);
        let ExprKind::Binary { op, rhs, .. } = rhs.kind else {
            panic!("expected Binary")
        };
        assert_eq!(op, BinOp::Mul);
        assert!(matches!(rhs.kind, ExprKind::Binary { op: BinOp::Pow, .. }));
    }

    #[test]
    fn subtraction_is_left_associative() {
        let ExprKind::Binary { op, lhs, .. } = insn_expr("insn x = a - b - c") else {
            panic!("expected Binary")
        };
        assert_eq!(op, BinOp::Sub);
        assert!(matches!(lhs.kind, ExprKind::Binary { op: BinOp::Sub, .. }));
    }

    #[test]
    fn unary_minus_and_floor_div() {
        let ExprKind::Binary { op, lhs, .. } = insn_expr("insn x = -i // 2") else {
            panic!("expected Binary")
        };
        assert_eq!(op, BinOp::FloorDiv);
        assert!(matches!(lhs.kind, ExprKind::Neg(_)));
    }

    #[test]
    fn reductions_and_calls() {
        let ExprKind::Reduce { op, inames, .. } = insn_expr("insn x = sum((j, @k), a[j, k])") else {
            panic!("expected Reduce")
        };
        assert_eq!(op.name, "sum");
        assert_eq!(inames.len(), 2);
        assert!(!inames[0].duplicate);
        assert!(inames[1].duplicate);

        assert!(matches!(insn_expr("insn x = sum(j, a[j])"), ExprKind::Reduce { .. }));
        assert!(matches!(insn_expr("insn x = sqrt(a + 1)"), ExprKind::Call { .. }));
        assert!(matches!(insn_expr("insn x = max(a + 1, b)"), ExprKind::Call { .. }));
    }

    #[test]
    fn tagged_variable() {
        assert_eq!(
            insn_expr("insn x = y$hold"),
            ExprKind::Tagged {
                name: "y".to_string(),
                tag: "hold".to_string()
            }
        );
    }

    #[test]
    fn syntax_error_is_reported() {
        let result = parse("insn x = (1 +");
        assert!(!result.errors.is_empty());
        assert!(result.source.is_none());
    }
}
