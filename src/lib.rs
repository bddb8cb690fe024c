//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Image transition planning for an IPS-style package client.
//!
//! The crate models package FMRIs and versions, parses manifests into
//! actions, tracks the catalog of known packages, and plans image
//! transitions: what to remove, what to update, what to install, in
//! an order that is safe to apply and wrapped in a boot-environment
//! snapshot.
//!
//! The usual flow is: resolve the requested FMRIs against the
//! [`catalog::Catalog`] and the [`constraint`] engine, propose the
//! resulting changes on an [`plan::ImagePlan`], evaluate it, and
//! execute it against an [`image::Image`].

#[allow(clippy::result_large_err)]
pub mod actions;
pub mod catalog;
pub mod constraint;
pub mod filter;
pub mod fmri;
pub mod image;
pub mod manifest;
pub mod plan;
pub mod transport;
