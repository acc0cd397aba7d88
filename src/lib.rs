//! # lowrank
//!
//! Numerical kernel for generalized low-rank models (GLRM). A GLRM represents
//! a data table A as the product of two rank-k factor matrices X (rows × k)
//! and Y (k × columns), fit under per-column loss functions and per-matrix
//! regularizers (Udell et al., 2016).
//!
//! This crate is the pure mathematical core that an alternating-minimization
//! training driver calls into:
//!
//! - [`loss`]: scalar losses and gradients for numeric columns, vector losses
//!   for categorical columns, and the decoders that map reconstructed values
//!   back into column domains.
//! - [`regularize`]: penalties, proximal operators, and feasible-set
//!   projections for the factor matrices.
//! - [`calibrate`]: the per-column offset ("generalized mean") and scale
//!   ("generalized inverse variance") solver that standardizes heterogeneous
//!   columns before factorization.
//! - [`score`]: per-row reconstruction, imputation, and error-metric
//!   accumulation over finished factors.
//!
//! The driver itself (initialization, the X/Y update loop, distributed
//! storage, persistence) lives outside this crate; everything here is a pure
//! function of its arguments and safe to call concurrently.

#![deny(unused_imports)]

pub mod calibrate;
pub mod data;
pub mod loss;
pub mod model;
pub mod regularize;
pub mod score;
