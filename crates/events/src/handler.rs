/// Decide and apply a command against an aggregate in one step.
///
/// Calls `handle` (no mutation) and, only if that succeeds, applies every
/// resulting event in order. On error the aggregate is left untouched.
/// Returns the applied events so the caller can record them.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: saleflow_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
