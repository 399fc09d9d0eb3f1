use divmg::assembly::{heat_problem, transport_problem, CartesianGrid};
use divmg::coarse::CoarsestMethod;
use divmg::hierarchy::Hierarchy;
use divmg::minimize::{MinimizationSolver, SolverConfig};
use divmg::utils::{euclidean_norm, format_duration, random_vec, zero_masked};
use divmg::{output_path, Vector};
use structopt::StructOpt;
use strum_macros::{Display, EnumString};

#[macro_use]
extern crate log;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "divmg_cli",
    about = "Multilevel constrained-minimization solver on a manufactured cube problem"
)]
struct Opt {
    /// Problem type. Options are: transport, heat
    problem: ProblemArg,

    /// Cells per direction on the finest grid; must be divisible by
    /// 2^(levels - 1)
    #[structopt(default_value = "8")]
    cells: usize,

    /// Number of levels in the hierarchy
    #[structopt(default_value = "3")]
    levels: usize,

    /// Coarsest solver. Options are: saddle, divfree
    #[structopt(default_value = "saddle")]
    coarsest: CoarsestArg,

    /// Maximum number of outer iterations
    #[structopt(default_value = "100")]
    max_iter: usize,

    /// Relative tolerance on the projected residual
    #[structopt(default_value = "1e-8")]
    tolerance: f64,
}

#[derive(Debug, Display, EnumString)]
#[strum(ascii_case_insensitive)]
enum ProblemArg {
    Transport,
    Heat,
}

#[derive(Debug, Display, EnumString)]
#[strum(ascii_case_insensitive)]
enum CoarsestArg {
    Saddle,
    DivFree,
}

fn main() {
    pretty_env_logger::init();
    let opt = Opt::from_args();

    let ess = [true, false, true, false, true, false];
    let grid = CartesianGrid::cube(opt.cells);
    let problem = match opt.problem {
        ProblemArg::Transport => transport_problem(grid, opt.levels, ess),
        ProblemArg::Heat => heat_problem(grid, opt.levels, ess, [true; 6]),
    }
    .unwrap();

    let timer = std::time::Instant::now();
    let hierarchy = Hierarchy::build(
        problem.functional,
        problem.constraint,
        problem.levels,
        problem.transfers,
    )
    .unwrap();
    info!("hierarchy built in {}", format_duration(&timer.elapsed()));
    info!("{:?}", hierarchy);

    // Manufactured exact solution: divergence-free part plus a particular
    // solution of random compatible constraint data.
    let finest = hierarchy.finest();
    let y = random_vec(finest.input().n_hcurl);
    let mut seed = random_vec(finest.offsets.n_hdiv);
    zero_masked(&mut seed, &finest.input().ess_hdiv);
    let constraint_rhs = &finest.constraint * &seed;
    let (particular, _) =
        divmg::assembly::particular_solution(&finest.constraint, &constraint_rhs, 5000, 1e-12);

    let mut x_exact = Vector::zeros(finest.offsets.total());
    {
        let mut hdiv = x_exact.slice_mut(ndarray::s![finest.offsets.hdiv_range()]);
        hdiv.assign(&particular);
        hdiv += &(&finest.curl * &y);
    }
    if finest.offsets.n_h1 > 0 {
        let mut s = random_vec(finest.offsets.n_h1);
        zero_masked(&mut s, &finest.input().ess_h1);
        x_exact
            .slice_mut(ndarray::s![finest.offsets.h1_range()])
            .assign(&s);
    }
    let rhs = &finest.functional * &x_exact;

    let config = SolverConfig {
        max_iter: opt.max_iter,
        tolerance: opt.tolerance,
        coarsest: match opt.coarsest {
            CoarsestArg::Saddle => CoarsestMethod::SaddlePoint,
            CoarsestArg::DivFree => CoarsestMethod::DivFree {
                max_iter: 10_000,
                tolerance: 1e-12,
            },
        },
        ..SolverConfig::default()
    };

    let timer = std::time::Instant::now();
    let solver = MinimizationSolver::new(&hierarchy, config).unwrap();
    info!("solver setup in {}", format_duration(&timer.elapsed()));

    let timer = std::time::Instant::now();
    let (x, info) = solver.solve(&rhs, &constraint_rhs, None).unwrap();
    let elapsed = timer.elapsed();
    info!("solve finished in {}", format_duration(&elapsed));

    let err = &x - &x_exact;
    let rel_err = euclidean_norm(&err) / euclidean_norm(&x_exact);
    let drift = &constraint_rhs
        - &(&finest.constraint * &x.slice(ndarray::s![finest.offsets.hdiv_range()]).to_owned());

    let report = serde_json::json!({
        "problem": opt.problem.to_string(),
        "cells": opt.cells,
        "levels": opt.levels,
        "coarsest": opt.coarsest.to_string(),
        "converged": info.converged,
        "iterations": info.iterations,
        "initial_residual": info.initial_residual,
        "final_residual": info.final_residual,
        "relative_error": rel_err,
        "constraint_residual": euclidean_norm(&drift),
        "solve_seconds": elapsed.as_secs_f64(),
    });
    println!("{}", serde_json::to_string_pretty(&report).unwrap());

    let path = output_path("report.json");
    std::fs::write(&path, serde_json::to_string_pretty(&report).unwrap()).unwrap();
    info!("report written to {}", path.display());
}
