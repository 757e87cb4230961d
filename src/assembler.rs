//! Two-pass translation from the front end's syntax tree to a [`MemoryImage`].
//!
//! Pass 1 lays the program out: it walks the items in source order, hands
//! each instruction or data directive the next free address, and records
//! every label and equate in the symbol table. Pass 2 walks the same items
//! again, evaluates operand expressions against the now-complete table
//! (which is what makes forward references work), encodes instructions and
//! writes data words.
//!
//! Errors do not abort the walk; they accumulate as [`Diagnostic`]s so a
//! client can show all of them at once. Any diagnostic means no image is
//! produced.


use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ast::{DataKind, Expr, Item, Mnemonic, Program, Span};
use crate::codec::{encode, CodecError, Instruction};
use crate::image::MemoryImage;
use crate::symbols::SymbolTable;
use crate::word::{is_address, is_value, Word, ADDRESS_MASK, ADDRESS_RANGE, ADDRESS_WIDTH};

/// Label that names the entry point when present.
pub const START_LABEL: &str = "START";

/// Knobs for a single assembly run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblerConfig {
    /// Address the location counter starts at.
    pub origin: u32,
    /// Label that, when defined, becomes the entry address.
    pub entry_label: String,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            origin: 0,
            entry_label: START_LABEL.to_owned(),
        }
    }
}

/// Everything that can go wrong while assembling. All variants are fatal to
/// producing an image.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum AssemblyError {
    #[error("symbol `{name}` is already defined (first defined at {first})")]
    DuplicateSymbol { name: String, first: Span },
    #[error("symbol `{name}` is never defined")]
    UndefinedSymbol { name: String },
    #[error("{value} is out of range for {what}")]
    OperandOutOfRange { what: String, value: i64 },
    #[error("{reason}")]
    InvalidDirective { reason: String },
}

/// An [`AssemblyError`] tied to the source position it was detected at.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{span}: {error}")]
pub struct Diagnostic {
    pub error: AssemblyError,
    pub span: Span,
}

impl Diagnostic {
    fn new(error: AssemblyError, span: Span) -> Self {
        Self { error, span }
    }
}

/// Assemble with the default configuration.
pub fn assemble(program: &Program) -> Result<MemoryImage, Vec<Diagnostic>> {
    assemble_with(program, &AssemblerConfig::default())
}

/// Assemble `program` into a memory image. All-or-nothing: any diagnostic
/// means `Err` with every problem found.
pub fn assemble_with(
    program: &Program,
    config: &AssemblerConfig,
) -> Result<MemoryImage, Vec<Diagnostic>> {
    let span = tracing::info_span!("assemble", items = program.items.len());
    let _guard = span.enter();

    let mut diagnostics = Vec::new();

    let layout = layout_pass(program, config, &mut diagnostics);
    tracing::debug!(
        symbols = layout.symbols.len(),
        "layout pass complete, {} diagnostic(s) so far",
        diagnostics.len()
    );

    let image = codegen_pass(program, config, &layout, &mut diagnostics);

    if diagnostics.is_empty() {
        tracing::info!(
            cells = image.len(),
            entry = format!("0x{:05X}", image.entry),
            "assembly succeeded"
        );
        Ok(image)
    } else {
        tracing::warn!("assembly failed with {} diagnostic(s)", diagnostics.len());
        Err(diagnostics)
    }
}

/// Result of pass 1: the complete symbol table and the address assigned to
/// every item, in item order.
struct Layout {
    symbols: SymbolTable,
    addresses: Vec<u32>,
    labels: IndexMap<String, u32>,
    first_instruction: Option<u32>,
}

fn layout_pass(program: &Program, config: &AssemblerConfig, diagnostics: &mut Vec<Diagnostic>) -> Layout {
    let span = tracing::debug_span!("layout_pass");
    let _guard = span.enter();

    let mut symbols = SymbolTable::new();
    let mut labels = IndexMap::new();
    let mut addresses = Vec::with_capacity(program.items.len());
    let mut counter = config.origin;
    let mut first_instruction = None;

    for item in &program.items {
        addresses.push(counter);
        match item {
            Item::Label { name, span } => {
                tracing::trace!(%name, address = format!("0x{counter:05X}"), "label");
                match symbols.define(name, counter as i64, *span) {
                    Ok(()) => {
                        labels.insert(name.clone(), counter);
                    }
                    Err(error) => diagnostics.push(Diagnostic::new(error, *span)),
                }
            }
            Item::Equ { name, value, span } => {
                // Equates may only reach backwards; evaluating here, against
                // the symbols seen so far, enforces that.
                match eval(value, &symbols) {
                    Ok(value) if is_value(value) => {
                        if let Err(error) = symbols.define(name, value, *span) {
                            diagnostics.push(Diagnostic::new(error, *span));
                        }
                    }
                    Ok(value) => diagnostics.push(Diagnostic::new(
                        AssemblyError::OperandOutOfRange {
                            what: "a 24-bit constant".to_owned(),
                            value,
                        },
                        *span,
                    )),
                    Err(error) => diagnostics.push(Diagnostic::new(error, *span)),
                }
            }
            Item::Instr { span, .. } => {
                if first_instruction.is_none() {
                    first_instruction = Some(counter);
                }
                counter = bump(counter, 1, *span, diagnostics);
            }
            Item::Data { kind, span } => {
                counter = bump(counter, kind.size(), *span, diagnostics);
            }
            Item::Origin { address, span } => match eval(address, &symbols) {
                Ok(value) if is_address(value) => {
                    tracing::trace!(address = format!("0x{value:05X}"), "origin");
                    counter = value as u32;
                }
                Ok(value) => diagnostics.push(Diagnostic::new(
                    AssemblyError::OperandOutOfRange {
                        what: "an origin address".to_owned(),
                        value,
                    },
                    *span,
                )),
                Err(error) => diagnostics.push(Diagnostic::new(error, *span)),
            },
        }
    }

    Layout {
        symbols,
        addresses,
        labels,
        first_instruction,
    }
}

/// Advance the location counter, flagging programs that run off the end of
/// the address space.
fn bump(counter: u32, size: u32, span: Span, diagnostics: &mut Vec<Diagnostic>) -> u32 {
    let next = counter as u64 + size as u64;
    if next > ADDRESS_RANGE as u64 {
        diagnostics.push(Diagnostic::new(
            AssemblyError::InvalidDirective {
                reason: format!(
                    "program runs past the end of the {ADDRESS_WIDTH}-bit address space"
                ),
            },
            span,
        ));
        return ADDRESS_RANGE;
    }
    next as u32
}

fn codegen_pass(
    program: &Program,
    config: &AssemblerConfig,
    layout: &Layout,
    diagnostics: &mut Vec<Diagnostic>,
) -> MemoryImage {
    let span = tracing::debug_span!("codegen_pass");
    let _guard = span.enter();

    let mut image = MemoryImage::new();

    for (item, &address) in program.items.iter().zip(&layout.addresses) {
        match item {
            Item::Label { .. } | Item::Equ { .. } | Item::Origin { .. } => {}
            Item::Instr {
                mnemonic,
                operand,
                span,
            } => {
                match build_instruction(*mnemonic, operand.as_ref(), &layout.symbols) {
                    Ok(instruction) => match encode(instruction) {
                        Ok(word) => {
                            tracing::trace!(
                                address = format!("0x{address:05X}"),
                                %word,
                                %instruction,
                                "emit"
                            );
                            write(&mut image, address, word, *span, diagnostics);
                        }
                        Err(CodecError::OperandOutOfRange { operand, width, .. }) => {
                            diagnostics.push(Diagnostic::new(
                                AssemblyError::OperandOutOfRange {
                                    what: format!("the {width}-bit operand field of {mnemonic}"),
                                    value: operand as i64,
                                },
                                *span,
                            ));
                        }
                    },
                    Err(error) => diagnostics.push(Diagnostic::new(error, *span)),
                }
            }
            Item::Data { kind, span } => {
                emit_data(&mut image, address, kind, &layout.symbols, *span, diagnostics);
            }
        }
    }

    image.entry = resolve_entry(config, layout, diagnostics);
    image.labels = layout.labels.clone();
    image
}

/// Resolve every symbol in an operand and build the decoded instruction.
fn build_instruction(
    mnemonic: Mnemonic,
    operand: Option<&Expr>,
    symbols: &SymbolTable,
) -> Result<Instruction, AssemblyError> {
    let operand = match (mnemonic.takes_operand(), operand) {
        (true, Some(expr)) => Some(eval(expr, symbols)?),
        (true, None) => {
            return Err(AssemblyError::InvalidDirective {
                reason: format!("{mnemonic} requires an operand"),
            })
        }
        (false, Some(_)) => {
            return Err(AssemblyError::InvalidDirective {
                reason: format!("{mnemonic} takes no operand"),
            })
        }
        (false, None) => None,
    };

    Ok(match mnemonic {
        // The constant is a 20-bit field the machine zero-extends; negative
        // constants down to -2^19 are stored two's-complement.
        Mnemonic::Ldc => Instruction::Ldc(immediate_field(operand.unwrap_or_default())?),
        Mnemonic::Ldv => Instruction::Ldv(address_field(operand.unwrap_or_default())?),
        Mnemonic::Stv => Instruction::Stv(address_field(operand.unwrap_or_default())?),
        Mnemonic::Add => Instruction::Add(address_field(operand.unwrap_or_default())?),
        Mnemonic::And => Instruction::And(address_field(operand.unwrap_or_default())?),
        Mnemonic::Or => Instruction::Or(address_field(operand.unwrap_or_default())?),
        Mnemonic::Xor => Instruction::Xor(address_field(operand.unwrap_or_default())?),
        Mnemonic::Eql => Instruction::Eql(address_field(operand.unwrap_or_default())?),
        Mnemonic::Jmp => Instruction::Jmp(address_field(operand.unwrap_or_default())?),
        Mnemonic::Jmn => Instruction::Jmn(address_field(operand.unwrap_or_default())?),
        Mnemonic::Ldiv => Instruction::Ldiv(address_field(operand.unwrap_or_default())?),
        Mnemonic::Stiv => Instruction::Stiv(address_field(operand.unwrap_or_default())?),
        Mnemonic::Call => Instruction::Call(address_field(operand.unwrap_or_default())?),
        Mnemonic::Halt => Instruction::Halt,
        Mnemonic::Not => Instruction::Not,
        Mnemonic::Rar => Instruction::Rar,
        Mnemonic::Ret => Instruction::Ret,
    })
}

fn emit_data(
    image: &mut MemoryImage,
    base: u32,
    kind: &DataKind,
    symbols: &SymbolTable,
    span: Span,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match kind {
        DataKind::Word(expr) => {
            if let Some(word) = eval_data_word(expr, symbols, span, diagnostics) {
                write(image, base, word, span, diagnostics);
            }
        }
        DataKind::Words(exprs) => {
            for (offset, expr) in exprs.iter().enumerate() {
                if let Some(word) = eval_data_word(expr, symbols, span, diagnostics) {
                    write(image, base + offset as u32, word, span, diagnostics);
                }
            }
        }
        DataKind::Reserve(count) => {
            for offset in 0..*count {
                write(image, base + offset, Word::ZERO, span, diagnostics);
            }
        }
        DataKind::Stringz(text) => {
            let mut offset = 0;
            for ch in text.chars() {
                write(image, base + offset, Word::new(ch as u32), span, diagnostics);
                offset += 1;
            }
            write(image, base + offset, Word::ZERO, span, diagnostics);
        }
    }
}

fn eval_data_word(
    expr: &Expr,
    symbols: &SymbolTable,
    span: Span,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<Word> {
    match eval(expr, symbols) {
        Ok(value) if is_value(value) => Some(Word::from_signed(value)),
        Ok(value) => {
            diagnostics.push(Diagnostic::new(
                AssemblyError::OperandOutOfRange {
                    what: "a 24-bit data word".to_owned(),
                    value,
                },
                span,
            ));
            None
        }
        Err(error) => {
            diagnostics.push(Diagnostic::new(error, span));
            None
        }
    }
}

/// Insert a word, flagging addresses that are populated twice (which can
/// only happen through origin directives jumping backwards).
fn write(
    image: &mut MemoryImage,
    address: u32,
    word: Word,
    span: Span,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if address >= ADDRESS_RANGE {
        // already flagged by the layout pass; don't double-report
        return;
    }
    if image.set(address, word).is_some() {
        diagnostics.push(Diagnostic::new(
            AssemblyError::InvalidDirective {
                reason: format!("address 0x{address:05X} is written twice"),
            },
            span,
        ));
    }
}

fn resolve_entry(
    config: &AssemblerConfig,
    layout: &Layout,
    diagnostics: &mut Vec<Diagnostic>,
) -> u32 {
    if let Some(symbol) = layout.symbols.get(&config.entry_label) {
        if is_address(symbol.value) {
            return symbol.value as u32;
        }
        diagnostics.push(Diagnostic::new(
            AssemblyError::OperandOutOfRange {
                what: "the entry address".to_owned(),
                value: symbol.value,
            },
            symbol.defined_at,
        ));
        return config.origin;
    }
    layout
        .first_instruction
        .unwrap_or(config.origin)
}

/// Evaluate a constant expression. Arithmetic wraps in i64, which is far
/// wider than any representable word; range checks happen at the use site.
fn eval(expr: &Expr, symbols: &SymbolTable) -> Result<i64, AssemblyError> {
    Ok(match expr {
        Expr::Number(value) => *value,
        Expr::Symbol(name) => symbols.resolve(name)?,
        Expr::Neg(inner) => eval(inner, symbols)?.wrapping_neg(),
        Expr::Add(lhs, rhs) => eval(lhs, symbols)?.wrapping_add(eval(rhs, symbols)?),
        Expr::Sub(lhs, rhs) => eval(lhs, symbols)?.wrapping_sub(eval(rhs, symbols)?),
        Expr::Mul(lhs, rhs) => eval(lhs, symbols)?.wrapping_mul(eval(rhs, symbols)?),
    })
}

/// An address operand: non-negative and inside the address range.
fn address_field(value: i64) -> Result<u32, AssemblyError> {
    if is_address(value) {
        Ok(value as u32)
    } else {
        Err(AssemblyError::OperandOutOfRange {
            what: "an address operand".to_owned(),
            value,
        })
    }
}

/// A 20-bit immediate. Negative values down to -2^19 are accepted and
/// stored two's-complement; the machine zero-extends when loading.
fn immediate_field(value: i64) -> Result<u32, AssemblyError> {
    if -(1 << (ADDRESS_WIDTH - 1)) <= value && value < (1 << ADDRESS_WIDTH) {
        Ok(value as u32 & ADDRESS_MASK)
    } else {
        Err(AssemblyError::OperandOutOfRange {
            what: format!("a {ADDRESS_WIDTH}-bit immediate"),
            value,
        })
    }
}
