mod consumer_tests;
mod pool_tests;
mod topic_matching_tests;
