//! Interface Validator
//!
//! Checks an [`InvocationRequest`] against a [`ContractInterface`] before
//! anything else happens. Checks run in a fixed order and the first failure
//! wins:
//!
//! 1. the endpoint exists
//! 2. every required parameter is present (declaration order)
//! 3. no parameter is unknown (name order)
//! 4. every supplied value fits its declared kind (declaration order)
//!
//! Pure function: no I/O, no state.

use std::collections::BTreeMap;

use crate::error::ValidationError;
use crate::orchestrator::InvocationRequest;
use crate::value::Value;
use crate::{ContractInterface, Endpoint};

/// A request that passed validation, with arguments bound to declared kinds
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCall<'a> {
    pub endpoint: &'a Endpoint,
    pub args: BTreeMap<String, Value>,
}

pub fn validate<'a>(
    interface: &'a ContractInterface,
    request: &InvocationRequest,
) -> Result<ValidatedCall<'a>, ValidationError> {
    let endpoint = interface.endpoint(&request.endpoint).ok_or_else(|| {
        ValidationError::EndpointNotFound {
            contract: interface.name.clone(),
            endpoint: request.endpoint.clone(),
        }
    })?;

    for param in endpoint.params.iter().filter(|p| p.required) {
        if !request.args.contains_key(&param.name) {
            return Err(ValidationError::ParameterMissing(param.name.clone()));
        }
    }

    if let Some(name) = request
        .args
        .keys()
        .find(|name| !endpoint.params.iter().any(|p| &p.name == *name))
    {
        return Err(ValidationError::ParameterUnexpected(name.clone()));
    }

    let mut args = BTreeMap::new();
    for param in &endpoint.params {
        let Some(value) = request.args.get(&param.name) else {
            continue;
        };
        let bound = param
            .kind
            .coerce(value)
            .ok_or_else(|| ValidationError::ParameterTypeMismatch {
                name: param.name.clone(),
                expected: param.kind,
                actual: value.kind(),
            })?;
        args.insert(param.name.clone(), bound);
    }

    Ok(ValidatedCall { endpoint, args })
}
