use harvester::api::WeeklyChurn;

/// Weekly churn and commit totals over several repositories.
///
/// Repositories report series of different lengths. They are aligned on their newest week,
/// so week `n` of every series lands in the same slot counted back from now.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActivityHistory {
    // newest week first
    churn: Vec<u64>,
    commits: Vec<u64>,
}

impl ActivityHistory {
    /// Adds one repository's series, both given oldest week first.
    pub fn add(&mut self, churn: &[WeeklyChurn], commits: &[u64]) {
        accumulate(&mut self.churn, churn.iter().rev().map(WeeklyChurn::changed_lines));
        accumulate(&mut self.commits, commits.iter().rev().copied());
    }

    pub fn weeks(&self) -> usize {
        self.churn.len().max(self.commits.len())
    }

    pub fn is_empty(&self) -> bool {
        self.weeks() == 0
    }

    /// Changed lines per week, oldest first.
    pub fn churn(&self) -> Vec<u64> {
        oldest_first(&self.churn, self.weeks())
    }

    /// Commits per week, oldest first.
    pub fn commits(&self) -> Vec<u64> {
        oldest_first(&self.commits, self.weeks())
    }

    pub fn lines(&self) -> Vec<String> {
        self.churn()
            .into_iter()
            .zip(self.commits())
            .enumerate()
            .map(|(index, (churn, commits))| {
                format!("Week {}: {} lines changed, {} commits", index + 1, churn, commits)
            })
            .collect()
    }
}

fn accumulate<I>(totals: &mut Vec<u64>, newest_first: I)
where
    I: Iterator<Item = u64>,
{
    for (index, value) in newest_first.enumerate() {
        if index == totals.len() {
            totals.push(0);
        }
        totals[index] += value;
    }
}

fn oldest_first(totals: &[u64], weeks: usize) -> Vec<u64> {
    (0..weeks).rev().map(|index| totals.get(index).copied().unwrap_or(0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn churn(lines: &[u64]) -> Vec<WeeklyChurn> {
        lines
            .iter()
            .enumerate()
            .map(|(week, lines)| WeeklyChurn::new(week as i64, *lines, 0))
            .collect()
    }

    #[test]
    fn aligns_on_newest_week_test() {
        let mut history = ActivityHistory::default();
        history.add(&churn(&[1, 2, 3]), &[5, 6, 7]);
        history.add(&churn(&[10]), &[20, 30]);
        assert_eq!(history.weeks(), 3);
        assert_eq!(history.churn(), vec![1, 2, 13]);
        assert_eq!(history.commits(), vec![5, 26, 37]);
        assert_eq!(
            history.lines()[2],
            "Week 3: 13 lines changed, 37 commits".to_string()
        );
    }

    #[test]
    fn missing_series_test() {
        let mut history = ActivityHistory::default();
        assert!(history.is_empty());
        history.add(&[], &[1, 2]);
        history.add(&churn(&[4]), &[]);
        assert_eq!(history.churn(), vec![0, 4]);
        assert_eq!(history.commits(), vec![1, 2]);
    }
}
