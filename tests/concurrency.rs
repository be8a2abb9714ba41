mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{amount, date, setup_test_env, transfer};
use ledger_engine::{
    api::{AccountSelector, RecurringEntryRequest, TemplateLineRequest},
    core::scheduler,
    ledger::{AccountNature, EntrySide, Frequency},
};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

const THREADS: usize = 8;
const POSTINGS_PER_THREAD: usize = 25;

#[test]
fn parallel_postings_keep_the_books_balanced() {
    let env = setup_test_env(date(2024, 5, 1));
    let cash = env.account("1000", "Cash", AccountNature::Asset);
    let revenue = env.account("4000", "Revenue", AccountNature::Income);
    let tills: Vec<_> = (0..THREADS)
        .map(|i| {
            env.account(
                &format!("11{:02}", i),
                &format!("Till {}", i),
                AccountNature::Asset,
            )
        })
        .collect();

    let workers: Vec<_> = (0..THREADS)
        .map(|i| {
            let manager = Arc::clone(&env.manager);
            thread::spawn(move || {
                let till = format!("11{:02}", i);
                let mut numbers = Vec::new();
                for n in 0..POSTINGS_PER_THREAD {
                    // Alternate between an account shared by every thread and one owned by this thread.
                    let request = if n % 2 == 0 {
                        transfer(date(2024, 5, 1), "1000", "4000", "1.00")
                    } else {
                        transfer(date(2024, 5, 1), &till, "4000", "2.50")
                    };
                    let entry = manager.post_journal_entry(request).expect("posting succeeds");
                    numbers.push(entry.entry_number);
                }
                numbers
            })
        })
        .collect();

    let mut numbers = HashSet::new();
    for worker in workers {
        for number in worker.join().expect("worker thread") {
            assert!(numbers.insert(number), "entry number {} issued twice", number);
        }
    }
    assert_eq!(numbers.len(), THREADS * POSTINGS_PER_THREAD);

    let shared_postings = THREADS * POSTINGS_PER_THREAD.div_ceil(2);
    let own_postings = POSTINGS_PER_THREAD / 2;
    assert_eq!(
        env.manager.get_balance(cash.id, None).unwrap(),
        Decimal::from(shared_postings as u64)
    );
    for till in &tills {
        assert_eq!(
            env.manager.get_balance(till.id, None).unwrap(),
            amount("2.50") * Decimal::from(own_postings as u64)
        );
    }
    let expected_revenue = Decimal::from(shared_postings as u64)
        + amount("2.50") * Decimal::from((THREADS * own_postings) as u64);
    assert_eq!(
        env.manager.get_balance(revenue.id, None).unwrap(),
        expected_revenue
    );

    let trial = env.manager.trial_balance(None).unwrap();
    assert!(trial.balanced);
    assert_eq!(trial.total_debits, expected_revenue);
    assert!(env.manager.verify_integrity().is_clean());
}

#[test]
fn scheduler_and_manual_postings_interleave_safely() {
    let env = setup_test_env(date(2024, 5, 1));
    env.account("1000", "Cash", AccountNature::Asset);
    env.account("6000", "Rent", AccountNature::Expense);
    env.manager
        .create_recurring(RecurringEntryRequest {
            name: "Daily rent accrual".into(),
            frequency: Frequency::Daily,
            start_date: date(2024, 4, 22),
            end_date: None,
            reference: String::new(),
            lines: vec![
                TemplateLineRequest {
                    account: AccountSelector::Code("6000".into()),
                    side: EntrySide::Debit,
                    amount: Some(amount("10")),
                    parameter: None,
                    description: String::new(),
                    cost_center: None,
                },
                TemplateLineRequest {
                    account: AccountSelector::Code("1000".into()),
                    side: EntrySide::Credit,
                    amount: Some(amount("10")),
                    parameter: None,
                    description: String::new(),
                    cost_center: None,
                },
            ],
            parameters: BTreeMap::new(),
            max_retries: None,
            approval_required: false,
            created_by: "ops".into(),
        })
        .unwrap();

    let handle = scheduler::spawn(Arc::clone(&env.manager), Duration::from_millis(5));
    for _ in 0..20 {
        env.manager
            .post_journal_entry(transfer(date(2024, 5, 1), "1000", "6000", "1"))
            .unwrap();
    }
    thread::sleep(Duration::from_millis(20));
    assert!(handle.stop() >= 1);

    // Ten daily occurrences from 22 April through 1 May, each posted exactly once.
    let rent = env.manager.find_account("6000").unwrap();
    assert_eq!(rent.current_balance, amount("100") - amount("20"));
    assert!(env.manager.trial_balance(None).unwrap().balanced);
    assert!(env.manager.verify_integrity().is_clean());
}
