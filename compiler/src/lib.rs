// pkc — Polyhedral Kernel Compiler
//
// Library root. Front end (lexer, parser, resolve), kernel model (domain,
// expr, kernel, device), preprocessing passes and the driver that runs them.

pub mod ast;
pub mod axes;
pub mod boost;
pub mod bounds;
pub mod cache;
pub mod device;
pub mod diag;
pub mod domain;
pub mod expr;
pub mod flops;
pub mod kernel;
pub mod lexer;
pub mod locality;
pub mod names;
pub mod parser;
pub mod pass;
pub mod poly;
pub mod preprocess;
pub mod reduction;
pub mod resolve;
pub mod schedule;
pub mod storage;
pub mod transform;
