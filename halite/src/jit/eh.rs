//! Exception-region bookkeeping for the translator: which clauses protect
//! an offset, which finally clauses run on a `leave`, and whether a control
//! edge crosses a region boundary it may not cross.

use crate::raw::il::{ExceptionClause, ExceptionClauseKind};

#[inline]
fn in_try(clause: &ExceptionClause, offset: u32) -> bool {
	clause.try_offset <= offset && offset < clause.try_end()
}

#[inline]
fn in_handler(clause: &ExceptionClause, offset: u32) -> bool {
	clause.handler_offset <= offset && offset < clause.handler_end()
}

/// Clauses whose try region protects `offset`, innermost first.
pub(crate) fn protecting_clauses(clauses: &[ExceptionClause], offset: u32) -> Vec<usize> {
	let mut result: Vec<usize> = (0..clauses.len())
		.filter(|index| in_try(&clauses[*index], offset))
		.collect();
	result.sort_by_key(|index| clauses[*index].try_length);
	result
}

/// The handler clause whose body contains `offset`, innermost first.
pub(crate) fn handler_clauses(clauses: &[ExceptionClause], offset: u32) -> Vec<usize> {
	let mut result: Vec<usize> = (0..clauses.len())
		.filter(|index| in_handler(&clauses[*index], offset))
		.collect();
	result.sort_by_key(|index| clauses[*index].handler_length);
	result
}

/// Region signature of an offset: every try and handler range containing it.
pub(crate) fn region_set(clauses: &[ExceptionClause], offset: u32) -> Vec<(usize, bool)> {
	let mut result = vec![];
	for (index, clause) in clauses.iter().enumerate() {
		if in_try(clause, offset) {
			result.push((index, false));
		}
		if in_handler(clause, offset) {
			result.push((index, true));
		}
	}
	result.sort_unstable();
	result
}

/// Validates a branch or fall-through edge. Leaving any region requires a
/// `leave`/`endfinally`/`throw`/`ret`; entering a try is only legal at its
/// first instruction, and handlers are never entered by an ordinary edge.
pub(crate) fn validate_edge(
	clauses: &[ExceptionClause],
	from: u32,
	to: u32,
) -> Result<(), crate::jit::JitError> {
	let source = region_set(clauses, from);
	let target = region_set(clauses, to);

	for region in &source {
		if !target.contains(region) {
			return Err(crate::jit::JitError::Verification(
				"control flow exits a protected region without leave",
			));
		}
	}
	for (index, is_handler) in &target {
		if source.contains(&(*index, *is_handler)) {
			continue;
		}
		if *is_handler {
			return Err(crate::jit::JitError::Verification(
				"control flow enters a handler region",
			));
		}
		if clauses[*index].try_offset != to {
			return Err(crate::jit::JitError::Verification(
				"control flow enters a try region past its first instruction",
			));
		}
	}
	Ok(())
}

/// Finally and fault clauses to run when leaving `from` for `target`,
/// innermost first.
pub(crate) fn finallies_on_leave(
	clauses: &[ExceptionClause],
	from: u32,
	target: u32,
) -> Vec<usize> {
	let mut result: Vec<usize> = (0..clauses.len())
		.filter(|index| {
			let clause = &clauses[*index];
			matches!(clause.kind, ExceptionClauseKind::Finally)
				&& in_try(clause, from)
				&& !in_try(clause, target)
		})
		.collect();
	result.sort_by_key(|index| clauses[*index].try_length);
	result
}

#[cfg(test)]
mod tests {
	use crate::raw::indices::metadata_token::TypeDefToken;
	use super::*;

	fn clause(kind: ExceptionClauseKind, try_range: (u32, u32), handler_range: (u32, u32)) -> ExceptionClause {
		ExceptionClause {
			kind,
			try_offset: try_range.0,
			try_length: try_range.1 - try_range.0,
			handler_offset: handler_range.0,
			handler_length: handler_range.1 - handler_range.0,
		}
	}

	fn catch(try_range: (u32, u32), handler_range: (u32, u32)) -> ExceptionClause {
		clause(ExceptionClauseKind::Catch(TypeDefToken(1).into()), try_range, handler_range)
	}

	#[test]
	fn protection_is_innermost_first() {
		let clauses = [
			catch((0, 40), (40, 50)),
			catch((10, 20), (20, 30)),
		];
		assert_eq!(protecting_clauses(&clauses, 15), vec![1, 0]);
		assert_eq!(protecting_clauses(&clauses, 35), vec![0]);
		assert_eq!(protecting_clauses(&clauses, 45), Vec::<usize>::new());
	}

	#[test]
	fn leave_runs_exited_finallies_inner_to_outer() {
		let clauses = [
			clause(ExceptionClauseKind::Finally, (0, 40), (40, 50)),
			clause(ExceptionClauseKind::Finally, (10, 20), (20, 30)),
		];
		assert_eq!(finallies_on_leave(&clauses, 15, 60), vec![1, 0]);
		assert_eq!(finallies_on_leave(&clauses, 15, 35), vec![1]);
		assert_eq!(finallies_on_leave(&clauses, 35, 36), Vec::<usize>::new());
	}

	#[test]
	fn edges_may_not_wander_across_regions() {
		let clauses = [catch((10, 20), (20, 30))];

		// Within one region, or wholly outside, is fine.
		assert!(validate_edge(&clauses, 12, 15).is_ok());
		assert!(validate_edge(&clauses, 0, 5).is_ok());
		// Entering at the first instruction of the try is fine.
		assert!(validate_edge(&clauses, 0, 10).is_ok());
		// Jumping into the middle of a try, out of a try, or into a handler
		// is not.
		assert!(validate_edge(&clauses, 0, 15).is_err());
		assert!(validate_edge(&clauses, 12, 0).is_err());
		assert!(validate_edge(&clauses, 0, 25).is_err());
	}
}
