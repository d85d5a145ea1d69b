// Einsum equation decoding
//
// Turns an equation like "ij,jk->ik" into index tables a backend can use to
// run the contraction as permute → broadcast multiply → sum:
//
//   all_dims     every label, output labels first: [i, k, j]
//   summed_dims  indices into all_dims that are contracted away: [2]
//   id_dims      per input, its labels as indices into all_dims:
//                  "ij" → [0, 2]    "jk" → [2, 1]
//
// Supported: one arrow, at most two inputs, each label at most once per
// term. Ellipsis and repeated labels (traces, diagonals) are rejected with
// an explicit error rather than computed wrongly.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::shape::Shape;

const ARROW: &str = "->";
const ELLIPSIS: &str = "...";
const MAX_INPUTS: usize = 2;

/// Index tables for an einsum equation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EinsumEquation {
    /// Every distinct label; output labels come first, in output order.
    pub all_dims: Vec<char>,
    /// Labels summed over, as indices into `all_dims`.
    pub summed_dims: Vec<usize>,
    /// For each input term, its labels as indices into `all_dims`.
    pub id_dims: Vec<Vec<usize>>,
}

impl EinsumEquation {
    /// Number of distinct labels.
    pub fn num_dims(&self) -> usize {
        self.all_dims.len()
    }
}

/// Parse `equation` for `num_tensors` input tensors. Whitespace is ignored.
pub fn decode_equation(equation: &str, num_tensors: usize) -> Result<EinsumEquation> {
    let equation: String = equation.chars().filter(|c| !c.is_whitespace()).collect();
    match equation.matches(ARROW).count() {
        0 => {
            return Err(Error::Einsum(
                "Equations without an arrow are not supported.".into(),
            ))
        }
        1 => {}
        _ => {
            return Err(Error::Einsum(format!(
                "Equation must contain exactly one arrow (\"{ARROW}\")."
            )))
        }
    }
    let (input, output) = equation
        .split_once(ARROW)
        .ok_or_else(|| Error::Einsum("Equations without an arrow are not supported.".into()))?;
    if input.contains(ELLIPSIS) {
        return Err(Error::Einsum(format!(
            "The ellipsis notation (\"{ELLIPSIS}\") is not supported yet."
        )));
    }

    let terms: Vec<&str> = input.split(',').collect();
    if terms.len() != num_tensors {
        return Err(Error::Einsum(format!(
            "Expected {} input tensors, received {num_tensors}",
            terms.len()
        )));
    }
    if terms.len() > MAX_INPUTS {
        return Err(Error::Einsum(format!(
            "Support for more than {MAX_INPUTS} input tensors is not implemented yet."
        )));
    }

    let mut all_dims: Vec<char> = Vec::new();
    for label in output.chars() {
        if !terms.iter().any(|t| t.contains(label)) {
            return Err(Error::Einsum(format!(
                "Output subscripts contain the label {label} not present in the input subscripts."
            )));
        }
        if all_dims.contains(&label) {
            return Err(Error::Einsum(format!(
                "Output subscripts contain the label {label} more than once."
            )));
        }
        all_dims.push(label);
    }
    for label in input.chars().filter(|&c| c != ',') {
        if !all_dims.contains(&label) {
            all_dims.push(label);
        }
    }

    let mut id_dims = Vec::with_capacity(terms.len());
    for term in &terms {
        let unique: HashSet<char> = term.chars().collect();
        if unique.len() != term.chars().count() {
            return Err(Error::Einsum(format!(
                "Found duplicate axes in input component {term}. \
                 Support for duplicate axes in input is not implemented yet."
            )));
        }
        let ids = term
            .chars()
            .map(|label| all_dims.iter().position(|&d| d == label).unwrap_or_default())
            .collect();
        id_dims.push(ids);
    }

    let num_out = output.chars().count();
    let summed_dims = (num_out..all_dims.len()).collect();
    Ok(EinsumEquation {
        all_dims,
        summed_dims,
        id_dims,
    })
}

/// How to bring one input into the `num_dims`-rank working layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EinsumPermutation {
    /// Axis order that sorts the input's labels by their `all_dims` index.
    pub permutation: Vec<usize>,
    /// Working axes the input lacks; they are inserted as size 1.
    pub expand_dims: Vec<usize>,
}

/// Permutation for an input whose labels are `id_dims`.
pub fn get_permutation(num_dims: usize, id_dims: &[usize]) -> EinsumPermutation {
    let mut slots: Vec<Option<usize>> = vec![None; num_dims];
    for (axis, &dim) in id_dims.iter().enumerate() {
        if let Some(slot) = slots.get_mut(dim) {
            *slot = Some(axis);
        }
    }
    let expand_dims = slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_none())
        .map(|(i, _)| i)
        .collect();
    let permutation = slots.into_iter().flatten().collect();
    EinsumPermutation {
        permutation,
        expand_dims,
    }
}

/// Check that every label has the same size in every input that uses it.
pub fn check_dim_sizes(num_dims: usize, id_dims: &[Vec<usize>], shapes: &[&Shape]) -> Result<()> {
    let mut sizes: Vec<Option<usize>> = vec![None; num_dims];
    for (ids, shape) in id_dims.iter().zip(shapes) {
        for (axis, &dim) in ids.iter().enumerate() {
            let got = shape.dim(axis)?;
            match sizes.get(dim).copied().flatten() {
                None => {
                    if let Some(slot) = sizes.get_mut(dim) {
                        *slot = Some(got);
                    }
                }
                Some(expected) if expected != got => {
                    return Err(Error::Einsum(format!(
                        "Expected dimension {expected} at axis {axis} of input shaped {shape}, \
                         but got dimension {got}"
                    )));
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// Order of contraction: which label is summed at each step and which
/// inputs join the running product first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EinsumPath {
    /// Label summed after each step. `None` for an equation with nothing to
    /// sum (transpose, outer product).
    pub path: Vec<Option<usize>>,
    /// Per step, the inputs multiplied in at that step.
    pub steps: Vec<Vec<usize>>,
}

/// Plan the contraction for `summed_dims` over the inputs in `id_dims`.
pub fn compute_path(summed_dims: &[usize], id_dims: &[Vec<usize>]) -> EinsumPath {
    let path: Vec<Option<usize>> = if summed_dims.is_empty() {
        vec![None]
    } else {
        summed_dims.iter().copied().map(Some).collect()
    };
    let mut steps = vec![Vec::new(); summed_dims.len() + 1];
    let mut used: Vec<usize> = Vec::new();
    for (step, dim) in path.iter().enumerate() {
        for (term, ids) in id_dims.iter().enumerate() {
            let wanted = match dim {
                None => true,
                Some(d) => ids.is_empty() || ids.contains(d),
            };
            if wanted && !used.contains(&term) {
                steps[step].push(term);
                used.push(term);
            }
        }
    }
    EinsumPath { path, steps }
}

/// Whether `perm` leaves every axis in place.
pub fn is_identity_permutation(perm: &[usize]) -> bool {
    perm.iter().enumerate().all(|(i, &p)| i == p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_matmul() {
        let eq = decode_equation("ij,jk->ik", 2).unwrap();
        assert_eq!(eq.all_dims, vec!['i', 'k', 'j']);
        assert_eq!(eq.summed_dims, vec![2]);
        assert_eq!(eq.id_dims, vec![vec![0, 2], vec![2, 1]]);
    }

    #[test]
    fn test_decode_ignores_whitespace() {
        let eq = decode_equation(" ij , j -> i ", 2).unwrap();
        assert_eq!(eq.all_dims, vec!['i', 'j']);
        assert_eq!(eq.id_dims, vec![vec![0, 1], vec![1]]);
    }

    #[test]
    fn test_decode_rejects_missing_and_double_arrow() {
        let err = decode_equation("ij,jk", 2).unwrap_err();
        assert!(err.to_string().contains("without an arrow"));
        let err = decode_equation("ij->j->i", 1).unwrap_err();
        assert!(err.to_string().contains("exactly one arrow"));
    }

    #[test]
    fn test_decode_limits() {
        let err = decode_equation("ij,jk,kl->il", 3).unwrap_err();
        assert!(err.to_string().contains("more than 2 input tensors"));
        let err = decode_equation("ii->i", 1).unwrap_err();
        assert!(err.to_string().contains("duplicate axes"));
        let err = decode_equation("...ij->ij", 1).unwrap_err();
        assert!(err.to_string().contains("ellipsis"));
        let err = decode_equation("ij,jk->ik", 1).unwrap_err();
        assert!(err.to_string().contains("Expected 2 input tensors, received 1"));
        let err = decode_equation("ij->iz", 1).unwrap_err();
        assert!(err.to_string().contains("label z"));
    }

    #[test]
    fn test_permutation_and_expand() {
        let p = get_permutation(3, &[2, 1]);
        assert_eq!(p.permutation, vec![1, 0]);
        assert_eq!(p.expand_dims, vec![0]);
        assert!(!is_identity_permutation(&p.permutation));
        assert!(is_identity_permutation(&get_permutation(3, &[0, 2]).permutation));
    }

    #[test]
    fn test_check_dim_sizes() {
        let eq = decode_equation("ij,jk->ik", 2).unwrap();
        let a = Shape::from((2, 3));
        let b = Shape::from((3, 4));
        check_dim_sizes(eq.num_dims(), &eq.id_dims, &[&a, &b]).unwrap();
        let bad = Shape::from((5, 4));
        let err = check_dim_sizes(eq.num_dims(), &eq.id_dims, &[&a, &bad]).unwrap_err();
        assert!(err.to_string().contains("Expected dimension 3 at axis 0"));
    }

    #[test]
    fn test_compute_path() {
        let eq = decode_equation("ij,jk->ik", 2).unwrap();
        let plan = compute_path(&eq.summed_dims, &eq.id_dims);
        assert_eq!(plan.path, vec![Some(2)]);
        assert_eq!(plan.steps, vec![vec![0, 1], vec![]]);

        let outer = decode_equation("i,j->ij", 2).unwrap();
        let plan = compute_path(&outer.summed_dims, &outer.id_dims);
        assert_eq!(plan.path, vec![None]);
        assert_eq!(plan.steps, vec![vec![0, 1]]);
    }
}
