//! Browser-driven access to the claims portal.
//!
//! A [`Portal`] is one exclusive session: the workflow logs in once, then for
//! every claim calls `search`, `read_phone` and `return_to_search` in that
//! order. Implementations never retry; timeouts come back as typed
//! [`PortalError`]s and the caller decides what to do with them.

pub mod epac;
pub mod webdriver;

use std::future::Future;

use crate::{credentials::Credential, error::PortalError};

pub trait Portal {
    /// What `search` hands back to identify the matching result row.
    type Hit;

    fn login(&mut self, credential: &Credential) -> impl Future<Output = Result<(), PortalError>>;

    /// Searches a claim id. `PortalError::NotFound` when no result row matches.
    fn search(&mut self, claim_id: &str) -> impl Future<Output = Result<Self::Hit, PortalError>>;

    /// Opens the claim file behind `hit`; `Ok(None)` when it carries no phone.
    fn read_phone(
        &mut self,
        hit: Self::Hit,
    ) -> impl Future<Output = Result<Option<String>, PortalError>>;

    fn return_to_search(&mut self) -> impl Future<Output = Result<(), PortalError>>;

    fn close(self) -> impl Future<Output = Result<(), PortalError>>
    where
        Self: Sized;
}
