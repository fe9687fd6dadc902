//! Overload selection among same-named methods.
//!
//! Arity must match exactly. Among the candidates whose parameters accept
//! every argument, the unique most specific one wins; a tie between equally
//! specific candidates is rejected rather than guessed.

use vesper_core::Type;

/// What a call site passes, as far as overload selection is concerned
#[derive(Debug, Clone, PartialEq)]
pub enum ArgShape {
    Typed(Type),
    /// `*`: binds the originating event, or the whole row for a
    /// collection-of-events parameter
    Wildcard,
}

impl ArgShape {
    pub fn accepted_by(&self, param: &Type) -> bool {
        match self {
            ArgShape::Typed(ty) => param.is_assignable_from(ty),
            ArgShape::Wildcard => accepts_event(param),
        }
    }
}

/// Parameters that receive an event reference rather than a property value.
pub fn accepts_event(param: &Type) -> bool {
    param.is_event() || param.element_type().is_some_and(Type::is_event)
}

#[derive(Debug, PartialEq)]
pub enum Selection {
    Unique(usize),
    /// No candidate with this arity
    NoArity,
    /// Arity matched but no candidate accepts the argument types; carries
    /// the first offending candidate and argument position
    Mismatch { candidate: usize, argument: usize },
    Ambiguous(Vec<usize>),
}

/// Choose among candidates given as parameter lists.
pub fn select(candidates: &[&[Type]], args: &[ArgShape]) -> Selection {
    let same_arity: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, params)| params.len() == args.len())
        .map(|(i, _)| i)
        .collect();
    if same_arity.is_empty() {
        return Selection::NoArity;
    }

    let applicable: Vec<usize> = same_arity
        .iter()
        .copied()
        .filter(|&i| {
            candidates[i]
                .iter()
                .zip(args)
                .all(|(param, arg)| arg.accepted_by(param))
        })
        .collect();

    if applicable.is_empty() {
        let candidate = same_arity[0];
        let argument = candidates[candidate]
            .iter()
            .zip(args)
            .position(|(param, arg)| !arg.accepted_by(param))
            .unwrap_or(0);
        return Selection::Mismatch {
            candidate,
            argument,
        };
    }

    let most_specific: Vec<usize> = applicable
        .iter()
        .copied()
        .filter(|&i| {
            applicable
                .iter()
                .all(|&j| i == j || more_specific(candidates[i], candidates[j]))
        })
        .collect();

    match most_specific.as_slice() {
        [only] => Selection::Unique(*only),
        [] => Selection::Ambiguous(applicable),
        many => Selection::Ambiguous(many.to_vec()),
    }
}

/// `a` is strictly more specific than `b` when each of `a`'s parameters
/// could be passed where `b`'s is declared and the lists differ. Duplicate
/// signatures therefore leave no unique winner.
fn more_specific(a: &[Type], b: &[Type]) -> bool {
    a.iter().zip(b).all(|(pa, pb)| pb.is_assignable_from(pa))
        && a != b
}
