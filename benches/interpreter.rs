use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mima_core::ast::{DataKind, Expr, Item, Mnemonic, Program, Span};
use mima_core::{assemble, Machine, RunOptions, Status};

fn sp(line: usize) -> Span {
    Span::new(line, 0)
}

/// Counts I down from `iterations` to zero, accumulating a sum through a
/// subroutine call per round. Touches every instruction class: loads,
/// stores, arithmetic, indirect addressing, conditional jumps, call/return.
fn countdown_program(iterations: i64) -> Program {
    Program::new(vec![
        Item::label("START", sp(1)),
        Item::instr_with(Mnemonic::Ldc, Expr::num(0), sp(1)),
        Item::instr_with(Mnemonic::Stv, Expr::sym("SUM"), sp(2)),
        Item::label("LOOP", sp(3)),
        Item::instr_with(Mnemonic::Ldv, Expr::sym("I"), sp(3)),
        Item::instr_with(Mnemonic::Jmn, Expr::sym("DONE"), sp(4)),
        Item::instr_with(Mnemonic::Call, Expr::sym("ACCUMULATE"), sp(5)),
        Item::instr_with(Mnemonic::Ldv, Expr::sym("I"), sp(6)),
        Item::instr_with(Mnemonic::Add, Expr::sym("MINUS1"), sp(7)),
        Item::instr_with(Mnemonic::Stv, Expr::sym("I"), sp(8)),
        Item::instr_with(Mnemonic::Jmp, Expr::sym("LOOP"), sp(9)),
        Item::label("DONE", sp(10)),
        Item::instr_with(Mnemonic::Ldv, Expr::sym("SUM"), sp(10)),
        Item::instr(Mnemonic::Halt, sp(11)),
        // ACCUMULATE: SUM += *PTR
        Item::label("ACCUMULATE", sp(13)),
        Item::instr_with(Mnemonic::Ldiv, Expr::sym("PTR"), sp(13)),
        Item::instr_with(Mnemonic::Add, Expr::sym("SUM"), sp(14)),
        Item::instr_with(Mnemonic::Stv, Expr::sym("SUM"), sp(15)),
        Item::instr(Mnemonic::Ret, sp(16)),
        Item::label("SUM", sp(18)),
        Item::data(DataKind::Word(Expr::num(0)), sp(18)),
        Item::label("I", sp(19)),
        Item::data(DataKind::Word(Expr::num(iterations)), sp(19)),
        Item::label("MINUS1", sp(20)),
        Item::data(DataKind::Word(Expr::num(-1)), sp(20)),
        Item::label("PTR", sp(21)),
        Item::data(DataKind::Word(Expr::sym("I")), sp(21)),
    ])
}

fn criterion_benchmark(c: &mut Criterion) {
    let program = countdown_program(500);

    c.bench_function("assemble countdown", |b| {
        b.iter(|| assemble(black_box(&program)).unwrap())
    });

    let image = assemble(&program).unwrap();

    c.bench_function("run countdown to halt", |b| {
        b.iter(|| {
            let mut machine = Machine::load(black_box(image.clone()));
            let result = machine.run(&RunOptions::default());
            assert_eq!(machine.status(), Status::Halted);
            black_box(result)
        })
    });

    let loaded = Machine::load(image);
    c.bench_function("reset and rerun", |b| {
        b.iter_batched(
            || loaded.clone(),
            |mut machine| {
                machine.reset();
                black_box(machine.run(&RunOptions::default()))
            },
            criterion::BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
