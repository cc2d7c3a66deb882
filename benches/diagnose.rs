use buildmedic::diagnose::{Catalog, Diagnoser};
use buildmedic::history::FixHistory;
use buildmedic::project::{BuildSystem, Language, ProjectContext};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

/// A long compiler log with the interesting line near the end.
fn synthetic_log(noise_lines: usize, tail: &str) -> String {
    let mut log = String::with_capacity(noise_lines * 64);
    for i in 0..noise_lines {
        log.push_str(&format!(
            "[{:>3}%] Building C object CMakeFiles/app.dir/src/module_{:04}.c.o\n",
            i * 100 / noise_lines.max(1),
            i
        ));
    }
    log.push_str(tail);
    log.push('\n');
    log
}

fn bench_first_match(c: &mut Criterion) {
    let catalog = Catalog::builtin();
    let log = synthetic_log(
        5_000,
        "src/window.c:3:10: fatal error: SDL2/SDL.h: No such file or directory",
    );

    c.bench_function("catalog_first_match_5k_lines", |b| {
        b.iter(|| black_box(catalog.first_match(black_box(&log)).is_some()));
    });

    let unknown = synthetic_log(5_000, "the build did something nobody expected");
    c.bench_function("catalog_no_match_5k_lines", |b| {
        b.iter(|| black_box(catalog.first_match(black_box(&unknown)).is_none()));
    });
}

fn bench_diagnose(c: &mut Criterion) {
    let catalog = Catalog::builtin();
    let temp = tempfile::tempdir().expect("tempdir");
    let project = ProjectContext::new(temp.path(), Language::C, BuildSystem::CMake);
    let log = synthetic_log(1_000, "main.c:(.text+0x1a): undefined reference to `SDL_Init'");

    c.bench_function("diagnose_with_fixes", |b| {
        let diagnoser = Diagnoser::new(&catalog);
        b.iter(|| black_box(diagnoser.diagnose(black_box(&log), Some(&project))));
    });

    let mut history = FixHistory::in_memory(temp.path().join("fix_history.json"));
    let seed = Diagnoser::new(&catalog).diagnose(&log, Some(&project));
    if let Some(fix) = seed.fixes.first() {
        history.record(&seed, fix, true, 1_200);
    }
    c.bench_function("diagnose_with_history", |b| {
        let diagnoser = Diagnoser::new(&catalog).with_history(&history);
        b.iter(|| black_box(diagnoser.diagnose(black_box(&log), Some(&project))));
    });

    c.bench_function("signatures_all_hits", |b| {
        let diagnoser = Diagnoser::new(&catalog);
        b.iter(|| black_box(diagnoser.signatures(black_box(&log)).len()));
    });
}

criterion_group!(diagnose, bench_first_match, bench_diagnose);
criterion_main!(diagnose);
